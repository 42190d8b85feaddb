// キャンセル伝播 - watchチャンネルによる協調的停止フラグ
// 各ステージは新しい仕事を始める前にこのフラグを確認する

use std::sync::Arc;
use tokio::sync::watch;

/// キャンセル要求側のハンドル
///
/// 何度呼んでも、どのスレッドから呼んでも効果は1回分。
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(tx),
        }
    }

    /// キャンセルを要求する(冪等)
    pub fn cancel(&self) {
        self.inner.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.borrow()
    }

    /// ステージへ配る監視側ハンドルを作成
    pub fn watch(&self) -> CancelWatch {
        CancelWatch {
            rx: self.inner.subscribe(),
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// キャンセル監視側のハンドル
#[derive(Clone)]
pub struct CancelWatch {
    rx: watch::Receiver<bool>,
}

impl CancelWatch {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// キャンセルされるまで待機する
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_cancel_is_observable() {
        let handle = CancelHandle::new();
        let watch = handle.watch();

        assert!(!handle.is_cancelled());
        assert!(!watch.is_cancelled());

        handle.cancel();

        assert!(handle.is_cancelled());
        assert!(watch.is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = CancelHandle::new();

        handle.cancel();
        handle.cancel();
        handle.cancel();

        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_concurrent_cancel_from_many_tasks() {
        let handle = CancelHandle::new();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { handle.cancel() }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wait_wakes_up() {
        let handle = CancelHandle::new();
        let mut watch = handle.watch();

        let waiter = tokio::spawn(async move {
            watch.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        timeout(Duration::from_millis(500), waiter)
            .await
            .expect("キャンセル後に待機は解除されるはず")
            .unwrap();
    }

    #[tokio::test]
    async fn test_watch_created_after_cancel_sees_state() {
        let handle = CancelHandle::new();
        handle.cancel();

        let watch = handle.watch();
        assert!(watch.is_cancelled());
    }
}
