// 汎用シンク実装
// 到達アイテムの記録用シンクと、何もしないシンク

use crate::core::{ItemSink, WorkItem};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// 到達したアイテムの番号と名前を記録するシンク(テスト・検証用)
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    received: Arc<Mutex<Vec<(u64, String)>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 到達順のシーケンス番号一覧
    pub fn sequences(&self) -> Vec<u64> {
        self.received
            .lock()
            .expect("sink lock poisoned")
            .iter()
            .map(|(sequence, _)| *sequence)
            .collect()
    }

    /// 到達順の表示名一覧
    pub fn names(&self) -> Vec<String> {
        self.received
            .lock()
            .expect("sink lock poisoned")
            .iter()
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.received.lock().expect("sink lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<T: Send + 'static> ItemSink<T> for CollectingSink {
    async fn consume(&self, item: &mut WorkItem<T>) -> Result<()> {
        self.received
            .lock()
            .expect("sink lock poisoned")
            .push((item.sequence(), item.name().to_string()));
        Ok(())
    }
}

/// 何もしないシンク(ベンチマーク用)
#[derive(Debug, Default, Clone)]
pub struct NullSink;

impl NullSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl<T: Send + 'static> ItemSink<T> for NullSink {
    async fn consume(&self, _item: &mut WorkItem<T>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collecting_sink_records_in_arrival_order() {
        let sink = CollectingSink::new();

        let mut first = WorkItem::new(1, "a.jpg", 0u64);
        let mut second = WorkItem::new(2, "b.jpg", 0u64);
        ItemSink::<u64>::consume(&sink, &mut first).await.unwrap();
        ItemSink::<u64>::consume(&sink, &mut second).await.unwrap();

        assert_eq!(sink.sequences(), vec![1, 2]);
        assert_eq!(sink.names(), vec!["a.jpg", "b.jpg"]);
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_collecting_sink_clones_share_storage() {
        let sink = CollectingSink::new();
        let clone = sink.clone();

        let mut item = WorkItem::new(1, "a", 0u64);
        ItemSink::<u64>::consume(&sink, &mut item).await.unwrap();

        assert_eq!(clone.len(), 1);
    }

    #[tokio::test]
    async fn test_null_sink_accepts_everything() {
        let sink = NullSink::new();
        let mut item = WorkItem::new(1, "a", 0u64);

        ItemSink::<u64>::consume(&sink, &mut item).await.unwrap();
    }
}
