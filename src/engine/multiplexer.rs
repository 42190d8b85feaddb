// Multiplexer - 並列ワーカー出力の順序復元
// シーケンス番号をキーとする最小ヒープで投入順どおりに流し直す

use super::failure::ErrorReporter;
use crate::core::{ErrorRecord, Message, PipelineError, PipelineResult, WorkItem, FIRST_SEQUENCE};
use crate::services::monitoring::QueueDepthGauge;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 順序待ちの1エントリ
///
/// `item` が `None` の場合は変換失敗で取り除かれたアイテムの占位。
/// 比較はシーケンス番号のみで行う。
struct PendingEntry<T> {
    sequence: u64,
    item: Option<WorkItem<T>>,
}

impl<T> PartialEq for PendingEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl<T> Eq for PendingEntry<T> {}

impl<T> PartialOrd for PendingEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PendingEntry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.sequence.cmp(&other.sequence)
    }
}

/// 順序復元タスクを起動
///
/// ファンアウト領域の全ワーカーが送信側を共有する1本のチャンネルを受け、
/// シーケンス番号の昇順(欠番は占位通知で埋まる)で下流へ流す。
/// 番兵はワーカー数ぶん届いたあと、待ちアイテムを全て流してから
/// 1つだけ下流へ転送する。
///
/// 番号の逆行や重複は順序不変条件の破れであり、報告のうえ
/// 致命的エラーとして実行を終了させる。
pub fn spawn_multiplexer<T: Send + 'static>(
    mut input: mpsc::Receiver<Message<T>>,
    producer_count: usize,
    output: mpsc::Sender<Message<T>>,
    errors: ErrorReporter,
    depth_in: Option<QueueDepthGauge>,
    depth_out: Option<QueueDepthGauge>,
) -> JoinHandle<PipelineResult<()>> {
    tokio::spawn(async move {
        let mut next_expected = FIRST_SEQUENCE;
        let mut ends_seen = 0usize;
        let mut heap: BinaryHeap<Reverse<PendingEntry<T>>> = BinaryHeap::new();
        let mut violation: Option<PipelineError> = None;

        while ends_seen < producer_count {
            let Some(message) = input.recv().await else {
                break;
            };

            match message {
                Message::End => {
                    ends_seen += 1;
                    continue;
                }
                Message::Item(item) => {
                    if let Some(gauge) = &depth_in {
                        gauge.decrement();
                    }
                    if item.sequence() < next_expected {
                        let error = PipelineError::sequence(format!(
                            "アイテム#{} が再到着しました (次の期待値は {})",
                            item.sequence(),
                            next_expected
                        ));
                        errors.report(ErrorRecord::new(
                            "multiplexer",
                            item.name(),
                            Some(item.sequence()),
                            error.to_string(),
                        ));
                        violation.get_or_insert(error);
                        continue;
                    }
                    heap.push(Reverse(PendingEntry {
                        sequence: item.sequence(),
                        item: Some(item),
                    }));
                }
                Message::Dropped(sequence) => {
                    if sequence < next_expected {
                        let error = PipelineError::sequence(format!(
                            "占位通知#{sequence} が再到着しました (次の期待値は {next_expected})"
                        ));
                        errors.report(ErrorRecord::new(
                            "multiplexer",
                            "",
                            Some(sequence),
                            error.to_string(),
                        ));
                        violation.get_or_insert(error);
                        continue;
                    }
                    heap.push(Reverse(PendingEntry {
                        sequence,
                        item: None,
                    }));
                }
            }

            // 先頭が期待値に一致している間だけ連続して流す
            while heap
                .peek()
                .is_some_and(|Reverse(entry)| entry.sequence == next_expected)
            {
                let Reverse(entry) = heap.pop().expect("peek済み");
                let message = match entry.item {
                    Some(item) => {
                        if let Some(gauge) = &depth_out {
                            gauge.increment();
                        }
                        Message::Item(item)
                    }
                    None => Message::Dropped(entry.sequence),
                };
                if output.send(message).await.is_err() {
                    return Err(PipelineError::channel(
                        "multiplexer: 下流チャンネルが閉じられました",
                    ));
                }
                next_expected += 1;
            }
        }

        // 全ワーカー終了後に待ちが残っていたら欠番が埋まらなかったということ。
        // 下流のスロット返却を止めないため残りは昇順で流し切ってから
        // 致命的エラーとして報告する。
        if !heap.is_empty() {
            let error = PipelineError::sequence(format!(
                "全ワーカー終了後に {} 件が順序待ちのまま残りました (次の期待値は {})",
                heap.len(),
                next_expected
            ));
            errors.report(ErrorRecord::new(
                "multiplexer",
                "",
                Some(next_expected),
                error.to_string(),
            ));
            violation.get_or_insert(error);

            while let Some(Reverse(entry)) = heap.pop() {
                let message = match entry.item {
                    Some(item) => Message::Item(item),
                    None => Message::Dropped(entry.sequence),
                };
                if output.send(message).await.is_err() {
                    break;
                }
            }
        }

        let _ = output.send(Message::End).await;

        match violation {
            Some(error) => Err(error),
            None => Ok(()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::failure::error_channel;

    fn item(sequence: u64) -> Message<u64> {
        Message::Item(WorkItem::new(sequence, format!("item-{sequence}"), sequence))
    }

    async fn collect_sequences(rx: &mut mpsc::Receiver<Message<u64>>) -> (Vec<u64>, usize) {
        let mut sequences = Vec::new();
        let mut ends = 0;
        while let Some(message) = rx.recv().await {
            match message {
                Message::Item(item) => sequences.push(item.sequence()),
                Message::Dropped(seq) => sequences.push(seq),
                Message::End => ends += 1,
            }
        }
        (sequences, ends)
    }

    #[tokio::test]
    async fn test_restores_order_from_shuffled_input() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (errors, _rx) = error_channel();
        let handle = spawn_multiplexer(in_rx, 1, out_tx, errors, None, None);

        for seq in [3u64, 1, 4, 2, 5] {
            in_tx.send(item(seq)).await.unwrap();
        }
        in_tx.send(Message::End).await.unwrap();
        drop(in_tx);

        let (sequences, ends) = collect_sequences(&mut out_rx).await;
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert_eq!(ends, 1);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sentinel_emitted_after_all_items() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (errors, _rx) = error_channel();
        let handle = spawn_multiplexer(in_rx, 3, out_tx, errors, None, None);

        // ワーカー2つが先に終了し、3つ目が遅れてアイテムを届ける
        in_tx.send(Message::End).await.unwrap();
        in_tx.send(item(2)).await.unwrap();
        in_tx.send(Message::End).await.unwrap();
        in_tx.send(item(1)).await.unwrap();
        in_tx.send(Message::End).await.unwrap();
        drop(in_tx);

        let (sequences, ends) = collect_sequences(&mut out_rx).await;
        // 番兵は全アイテムより後に1つだけ
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(ends, 1);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_marker_fills_gap() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (errors, _rx) = error_channel();
        let handle = spawn_multiplexer(in_rx, 1, out_tx, errors, None, None);

        // #2は変換失敗で占位通知のみ届く
        in_tx.send(item(3)).await.unwrap();
        in_tx.send(item(1)).await.unwrap();
        in_tx.send(Message::Dropped(2)).await.unwrap();
        in_tx.send(Message::End).await.unwrap();
        drop(in_tx);

        let (sequences, ends) = collect_sequences(&mut out_rx).await;
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(ends, 1);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_sequence_is_fatal() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (errors, mut error_rx) = error_channel();
        let handle = spawn_multiplexer(in_rx, 1, out_tx, errors, None, None);

        in_tx.send(item(1)).await.unwrap();
        in_tx.send(item(1)).await.unwrap();
        in_tx.send(Message::End).await.unwrap();
        drop(in_tx);

        let (sequences, _ends) = collect_sequences(&mut out_rx).await;
        assert_eq!(sequences, vec![1]);

        let record = error_rx.recv().await.unwrap();
        assert_eq!(record.stage, "multiplexer");

        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(PipelineError::SequenceError { .. })
        ));
    }

    #[tokio::test]
    async fn test_unfilled_gap_is_fatal_but_flushes() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (errors, mut error_rx) = error_channel();
        let handle = spawn_multiplexer(in_rx, 1, out_tx, errors, None, None);

        // #1が欠けたままワーカーが終了する
        in_tx.send(item(2)).await.unwrap();
        in_tx.send(item(3)).await.unwrap();
        in_tx.send(Message::End).await.unwrap();
        drop(in_tx);

        let (sequences, ends) = collect_sequences(&mut out_rx).await;
        // 残りは流し切られる(下流のスロット返却を止めない)
        assert_eq!(sequences, vec![2, 3]);
        assert_eq!(ends, 1);

        assert!(error_rx.recv().await.is_some());
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_empty_run_emits_single_sentinel() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (errors, _rx) = error_channel();
        let handle = spawn_multiplexer(in_rx, 2, out_tx, errors, None, None);

        in_tx.send(Message::End).await.unwrap();
        in_tx.send(Message::End).await.unwrap();
        drop(in_tx);

        let (sequences, ends) = collect_sequences(&mut out_rx).await;
        assert!(sequences.is_empty());
        assert_eq!(ends, 1);
        handle.await.unwrap().unwrap();
    }
}
