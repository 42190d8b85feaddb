// Stage - パイプライン段のワーカータスク
// 入力チャンネルから受信し、変換を適用して下流へ転送する

use super::cancel::CancelHandle;
use super::failure::ErrorReporter;
use super::governor::GovernorHandle;
use crate::core::{
    ErrorRecord, ItemSink, Message, PipelineError, PipelineObserver, PipelineResult, Transform,
};
use crate::services::monitoring::{QueueDepthGauge, RunStatistics};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// ステージワーカーが共有するハンドル一式
///
/// キャンセルは監視だけでなく要求側ハンドルを持つ。失敗した
/// ステージ自身が直ちに停止を broadcast するため。
pub struct StageContext {
    pub name: String,
    pub cancel: CancelHandle,
    pub errors: ErrorReporter,
    pub governor: GovernorHandle,
    pub depth_in: Option<QueueDepthGauge>,
    pub depth_out: Option<QueueDepthGauge>,
}

impl StageContext {
    fn note_received(&self) {
        if let Some(gauge) = &self.depth_in {
            gauge.decrement();
        }
    }

    fn note_sent(&self) {
        if let Some(gauge) = &self.depth_out {
            gauge.increment();
        }
    }
}

/// 終端ステージの集計カウンタ(実行全体で共有)
#[derive(Clone, Default)]
pub struct SinkCounters {
    pub completed: Arc<AtomicU64>,
    pub skipped: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
}

impl SinkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// 変換ステージのワーカーを起動
///
/// 動作規約:
/// - アイテム受信時、キャンセル済みなら変換せずそのまま下流へ流す(ドレイン)
/// - 変換失敗時は失敗を報告し、アイテムを取り除いてスロットを返却し、
///   欠番防止の占位通知だけを下流へ流す
/// - 番兵受信時は番兵を1つだけ下流へ転送してから停止する
pub fn spawn_transform_stage<T: Send + 'static>(
    ctx: StageContext,
    transform: Arc<dyn Transform<T>>,
    mut input: mpsc::Receiver<Message<T>>,
    output: mpsc::Sender<Message<T>>,
) -> JoinHandle<PipelineResult<()>> {
    tokio::spawn(async move {
        while let Some(message) = input.recv().await {
            match message {
                Message::End => {
                    let _ = output.send(Message::End).await;
                    return Ok(());
                }
                Message::Dropped(sequence) => {
                    if output.send(Message::Dropped(sequence)).await.is_err() {
                        return Err(PipelineError::channel(format!(
                            "stage '{}': 下流チャンネルが閉じられました",
                            ctx.name
                        )));
                    }
                }
                Message::Item(mut item) => {
                    ctx.note_received();

                    if ctx.cancel.is_cancelled() {
                        // ドレイン中は変換を飛ばして流し切る
                        ctx.note_sent();
                        if output.send(Message::Item(item)).await.is_err() {
                            return Err(PipelineError::channel(format!(
                                "stage '{}': 下流チャンネルが閉じられました",
                                ctx.name
                            )));
                        }
                        continue;
                    }

                    item.perf.phase_start(&ctx.name);
                    match transform.apply(&mut item).await {
                        Ok(()) => {
                            item.perf.phase_end();
                            ctx.note_sent();
                            if output.send(Message::Item(item)).await.is_err() {
                                return Err(PipelineError::channel(format!(
                                    "stage '{}': 下流チャンネルが閉じられました",
                                    ctx.name
                                )));
                            }
                        }
                        Err(error) => {
                            let sequence = item.sequence();
                            // 失敗したステージが自ら停止を要求する
                            ctx.cancel.cancel();
                            ctx.errors.report(ErrorRecord::new(
                                &ctx.name,
                                item.name(),
                                Some(sequence),
                                error.to_string(),
                            ));
                            // このアイテムはここで取り除くのでスロットも
                            // ここで返却する(返却はアイテムにつき1回だけ)
                            ctx.governor.free_slot();
                            if output.send(Message::Dropped(sequence)).await.is_err() {
                                return Err(PipelineError::channel(format!(
                                    "stage '{}': 下流チャンネルが閉じられました",
                                    ctx.name
                                )));
                            }
                        }
                    }
                }
            }
        }

        // 上流が番兵なしで消えた場合でも下流には番兵を流して停止を伝える
        let _ = output.send(Message::End).await;
        Ok(())
    })
}

/// 終端ステージのワーカーを起動
///
/// アイテムをシンクへ引き渡し、成否にかかわらずスロットを返却する。
/// キャンセル後に届いたアイテムはシンクへ渡さず破棄する。
#[allow(clippy::too_many_arguments)]
pub fn spawn_sink_stage<T: Send + 'static>(
    ctx: StageContext,
    sink: Arc<dyn ItemSink<T>>,
    mut input: mpsc::Receiver<Message<T>>,
    counters: SinkCounters,
    observer: Arc<dyn PipelineObserver>,
    statistics: Arc<Mutex<RunStatistics>>,
) -> JoinHandle<PipelineResult<()>> {
    tokio::spawn(async move {
        while let Some(message) = input.recv().await {
            match message {
                Message::End => break,
                Message::Dropped(_) => {
                    // スロットは取り除いたステージが返却済み
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                Message::Item(mut item) => {
                    ctx.note_received();

                    if ctx.cancel.is_cancelled() {
                        counters.skipped.fetch_add(1, Ordering::Relaxed);
                        ctx.governor.free_slot();
                        continue;
                    }

                    item.perf.phase_start(&ctx.name);
                    let outcome = sink.consume(&mut item).await;
                    item.perf.phase_end();

                    match outcome {
                        Ok(()) => {
                            counters.completed.fetch_add(1, Ordering::Relaxed);
                            statistics
                                .lock()
                                .expect("statistics lock poisoned")
                                .record(&item.perf);
                            observer.item_completed(item.sequence(), &item.perf).await;
                        }
                        Err(error) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            ctx.cancel.cancel();
                            ctx.errors.report(ErrorRecord::new(
                                &ctx.name,
                                item.name(),
                                Some(item.sequence()),
                                error.to_string(),
                            ));
                        }
                    }
                    ctx.governor.free_slot();
                }
            }
        }
        Ok(())
    })
}
