// 失敗の収集 - 最初の1件だけを呼び出し元へ引き渡す
// 全ての失敗はキャンセル要求に変換され、パイプラインは必ず停止へ向かう

use super::cancel::CancelHandle;
use crate::core::{ErrorRecord, PipelineObserver};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 実行ごとに1度だけ呼ばれるエラーコールバック
pub type ErrorCallback = Box<dyn FnOnce(ErrorRecord) + Send + 'static>;

/// 各ステージへ配る失敗報告ハンドル
#[derive(Clone)]
pub struct ErrorReporter {
    tx: mpsc::UnboundedSender<ErrorRecord>,
}

impl ErrorReporter {
    /// 失敗を1件報告する(ブロックしない)
    pub fn report(&self, record: ErrorRecord) {
        // 監視タスクが先に終了していても報告側は失敗にしない
        let _ = self.tx.send(record);
    }
}

/// 失敗報告チャンネルを作成
pub fn error_channel() -> (ErrorReporter, mpsc::UnboundedReceiver<ErrorRecord>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ErrorReporter { tx }, rx)
}

/// 失敗監視タスクを起動
///
/// 最初の1件でキャンセルを要求しコールバックを発火する。
/// ドレイン中に届く2件目以降は監視者への通知のみ行い破棄する。
/// 全報告ハンドルが破棄された後、最初の1件を返して終了する。
pub fn spawn_error_monitor(
    mut error_rx: mpsc::UnboundedReceiver<ErrorRecord>,
    cancel: CancelHandle,
    observer: Arc<dyn PipelineObserver>,
    callback: Option<ErrorCallback>,
) -> JoinHandle<Option<ErrorRecord>> {
    tokio::spawn(async move {
        let mut first: Option<ErrorRecord> = None;
        let mut callback = callback;

        while let Some(record) = error_rx.recv().await {
            observer.item_failed(&record).await;

            if first.is_none() {
                cancel.cancel();
                if let Some(cb) = callback.take() {
                    cb(record.clone());
                }
                first = Some(record);
            }
        }

        first
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::monitoring::NoOpPipelineObserver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(seq: u64) -> ErrorRecord {
        ErrorRecord::new("filter", format!("item-{seq}"), Some(seq), "failed")
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let (reporter, rx) = error_channel();
        let cancel = CancelHandle::new();
        let monitor =
            spawn_error_monitor(rx, cancel.clone(), Arc::new(NoOpPipelineObserver::new()), None);

        reporter.report(record(37));
        reporter.report(record(38));
        reporter.report(record(39));
        drop(reporter);

        let first = monitor.await.unwrap();
        assert_eq!(first.unwrap().sequence, Some(37));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_callback_fires_exactly_once() {
        let (reporter, rx) = error_channel();
        let fired = Arc::new(AtomicUsize::new(0));
        let callback: ErrorCallback = {
            let fired = Arc::clone(&fired);
            Box::new(move |_record: ErrorRecord| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };

        let monitor = spawn_error_monitor(
            rx,
            CancelHandle::new(),
            Arc::new(NoOpPipelineObserver::new()),
            Some(callback),
        );

        for seq in 1..=5 {
            reporter.report(record(seq));
        }
        drop(reporter);
        monitor.await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_errors_yields_none() {
        let (reporter, rx) = error_channel();
        let cancel = CancelHandle::new();
        let monitor =
            spawn_error_monitor(rx, cancel.clone(), Arc::new(NoOpPipelineObserver::new()), None);

        drop(reporter);

        assert!(monitor.await.unwrap().is_none());
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_reporting_without_receiver_is_harmless() {
        let (reporter, rx) = error_channel();
        drop(rx);

        // 受信側が先に消えても報告側はパニックしない
        reporter.report(record(1));
    }
}
