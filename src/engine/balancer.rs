// Balancer - ファンアウト領域へのアイテム分配
// 単一の分配タスクが厳密なラウンドロビンでワーカーへ割り当てる

use crate::core::{Message, PipelineError, PipelineResult};
use crate::services::monitoring::QueueDepthGauge;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// ラウンドロビン分配タスクを起動
///
/// 各アイテムはちょうど1つのワーカーに渡り、どのワーカーも恒常的に
/// 飢餓しない。番兵は全ワーカーへ1つずつ複製して配ってから停止する。
/// ワーカーが1つの場合は単純な転送になる。
pub fn spawn_round_robin_dispatcher<T: Send + 'static>(
    mut input: mpsc::Receiver<Message<T>>,
    workers: Vec<mpsc::Sender<Message<T>>>,
    depth_in: Option<QueueDepthGauge>,
    depth_out: Option<QueueDepthGauge>,
) -> JoinHandle<PipelineResult<()>> {
    debug_assert!(!workers.is_empty());
    tokio::spawn(async move {
        let mut next_worker = 0usize;

        while let Some(message) = input.recv().await {
            match message {
                Message::End => {
                    for worker in &workers {
                        let _ = worker.send(Message::End).await;
                    }
                    return Ok(());
                }
                message => {
                    if let Message::Item(_) = &message {
                        if let Some(gauge) = &depth_in {
                            gauge.decrement();
                        }
                        if let Some(gauge) = &depth_out {
                            gauge.increment();
                        }
                    }
                    if workers[next_worker].send(message).await.is_err() {
                        return Err(PipelineError::channel(format!(
                            "dispatcher: ワーカー{next_worker}の入力チャンネルが閉じられました"
                        )));
                    }
                    next_worker = (next_worker + 1) % workers.len();
                }
            }
        }

        // 上流が番兵なしで消えた場合でも全ワーカーへ停止を伝える
        for worker in &workers {
            let _ = worker.send(Message::End).await;
        }
        Ok(())
    })
}
