// 表示シンク - 完成した画像をコンソールへ報告する終端

use super::transforms::ImagePayload;
use crate::core::{ItemSink, WorkItem};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// コンソールへの「表示」シンク
///
/// GUIを持たないため表示は1行のログで代替し、直近に完成した
/// アイテムを保持して照会できるようにする。
#[derive(Debug, Default, Clone)]
pub struct ConsoleDisplaySink {
    quiet: bool,
    latest: Arc<Mutex<Option<(u64, String)>>>,
}

impl ConsoleDisplaySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quiet() -> Self {
        Self {
            quiet: true,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    /// 直近に表示したアイテム(シーケンス番号と名前)
    pub fn latest(&self) -> Option<(u64, String)> {
        self.latest.lock().expect("sink lock poisoned").clone()
    }
}

#[async_trait]
impl ItemSink<ImagePayload> for ConsoleDisplaySink {
    async fn consume(&self, item: &mut WorkItem<ImagePayload>) -> Result<()> {
        let dimensions = item
            .payload
            .image
            .as_ref()
            .map(|image| (image.width(), image.height()));

        if !self.quiet {
            match dimensions {
                Some((width, height)) => {
                    println!("🖼  #{} {} ({width}x{height})", item.sequence(), item.name())
                }
                None => println!("🖼  #{} {} (未読み込み)", item.sequence(), item.name()),
            }
        }

        *self.latest.lock().expect("sink lock poisoned") =
            Some((item.sequence(), item.name().to_string()));
        Ok(())
    }
}
