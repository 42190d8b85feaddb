// キュー深度の計測 - ステージ間チャンネルごとの滞留アイテム数
// ロックではなくアトミックカウンタで追跡する(診断専用・非権威値)

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// ステージ間チャンネル1本分の深度ゲージ
///
/// 送信側がincrement、受信側がdecrementする。番兵と占位通知は数えない。
#[derive(Debug, Clone, Default)]
pub struct QueueDepthGauge {
    count: Arc<AtomicUsize>,
}

impl QueueDepthGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}
