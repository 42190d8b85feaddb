// Governor - パイプライン容量の統制
// 共有メモリのセマフォではなくメッセージ交換で実装したスロット管理

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::mpsc;

/// パイプラインに同時に流せるアイテム数を固定容量で統制する
///
/// 先頭ステージは投入前に `wait_for_slot` を呼び、終端ステージは
/// アイテム1件の完了ごとに `GovernorHandle::free_slot` を1回だけ呼ぶ。
/// 終了時は先頭ステージが `wait_for_empty` で全スロットの返却を待つ。
/// 返却漏れがあると `wait_for_empty` は戻らない。これは回復対象ではなく
/// 実装欠陥として扱う。
pub struct PipelineGovernor {
    capacity: usize,
    phase: usize,
    completed_tx: mpsc::UnboundedSender<()>,
    completed_rx: mpsc::UnboundedReceiver<()>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

/// 終端ステージ(と失敗時の各ステージ)へ渡すスロット返却ハンドル
#[derive(Clone)]
pub struct GovernorHandle {
    completed_tx: mpsc::UnboundedSender<()>,
    in_flight: Arc<AtomicUsize>,
}

impl PipelineGovernor {
    pub fn new(capacity: usize) -> Self {
        Self::with_gauges(
            capacity,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    /// 診断用ゲージを外部から共有する形で作成
    pub fn with_gauges(
        capacity: usize,
        in_flight: Arc<AtomicUsize>,
        peak_in_flight: Arc<AtomicUsize>,
    ) -> Self {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        in_flight.store(0, Ordering::Relaxed);
        peak_in_flight.store(0, Ordering::Relaxed);
        Self {
            capacity,
            phase: 0,
            completed_tx,
            completed_rx,
            in_flight,
            peak_in_flight,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 現在パイプライン内にあるアイテム数(診断用)
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// スロット返却ハンドルを取得
    pub fn handle(&self) -> GovernorHandle {
        GovernorHandle {
            completed_tx: self.completed_tx.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// 空きスロットができるまで待つ
    ///
    /// 最初の `capacity` 回は即座に返り、以降は返却1件と引き換えに返る。
    pub async fn wait_for_slot(&mut self) {
        if self.phase < self.capacity {
            self.phase += 1;
        } else {
            // 自身が送信側を保持しているためNoneにはならない
            let _ = self.completed_rx.recv().await;
        }
        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::Relaxed);
    }

    /// 全スロットが返却されるまで待つ
    pub async fn wait_for_empty(&mut self) {
        while self.phase > 0 {
            self.phase -= 1;
            let _ = self.completed_rx.recv().await;
        }
    }
}

impl GovernorHandle {
    /// スロットを1つ返却する(ブロックしない)
    pub fn free_slot(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        let _ = self.completed_tx.send(());
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}
