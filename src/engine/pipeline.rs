// Pipeline - トポロジの組み立てと実行駆動
// ステージ合成はすべてここで行い、各ステージは互いの存在を知らない

use super::balancer::spawn_round_robin_dispatcher;
use super::cancel::CancelHandle;
use super::failure::{error_channel, spawn_error_monitor, ErrorCallback};
use super::governor::PipelineGovernor;
use super::multiplexer::spawn_multiplexer;
use super::stage::{spawn_sink_stage, spawn_transform_stage, SinkCounters, StageContext};
use crate::core::{
    ErrorRecord, FnTransform, ItemSink, ItemSource, Message, PipelineConfig, PipelineError,
    PipelineObserver, PipelineResult, RunSummary, Transform, WorkItem, FIRST_SEQUENCE,
};
use crate::services::monitoring::{NoOpPipelineObserver, QueueDepthGauge, RunStatistics};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// パイプラインの実行形態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// 並行性なしの単一ループ
    Sequential,
    /// ステージごとに1ワーカーを連結したデータフロー
    Linear,
    /// 指定ステージをNワーカーへ広げ、順序復元で絞り直すデータフロー
    Balanced,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Linear => "linear",
            Self::Balanced => "balanced",
        }
    }
}

/// ステージ1段分の定義
struct StageSpec<T> {
    name: String,
    transform: Arc<dyn Transform<T>>,
}

/// パイプラインの組み立てビルダー
pub struct PipelineBuilder<T: Send + 'static> {
    config: Arc<dyn PipelineConfig>,
    topology: Topology,
    stages: Vec<StageSpec<T>>,
    balanced_index: Option<usize>,
    sink: Option<Arc<dyn ItemSink<T>>>,
    observer: Arc<dyn PipelineObserver>,
    on_error: Option<ErrorCallback>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    pub fn new(config: impl PipelineConfig + 'static) -> Self {
        Self {
            config: Arc::new(config),
            topology: Topology::Linear,
            stages: Vec::new(),
            balanced_index: None,
            sink: None,
            observer: Arc::new(NoOpPipelineObserver::new()),
            on_error: None,
        }
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// 変換ステージを追加する(追加順に連結される)
    pub fn stage(mut self, name: impl Into<String>, transform: Arc<dyn Transform<T>>) -> Self {
        self.stages.push(StageSpec {
            name: name.into(),
            transform,
        });
        self
    }

    /// 同期クロージャをそのままステージとして追加する
    pub fn stage_fn<F>(self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut WorkItem<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.stage(name, Arc::new(FnTransform::new(func)))
    }

    /// バランス型トポロジで並列化するステージを追加する
    pub fn balanced_stage(
        mut self,
        name: impl Into<String>,
        transform: Arc<dyn Transform<T>>,
    ) -> Self {
        self.balanced_index = Some(self.stages.len());
        self.stage(name, transform)
    }

    pub fn sink(mut self, sink: Arc<dyn ItemSink<T>>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// 最初の失敗1件だけを受け取るコールバックを登録する
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(ErrorRecord) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> PipelineResult<Pipeline<T>> {
        if self.config.pipeline_capacity() == 0 {
            return Err(PipelineError::configuration(
                "容量は1以上である必要があります",
            ));
        }
        if self.config.worker_count() == 0 {
            return Err(PipelineError::configuration(
                "ワーカー数は1以上である必要があります",
            ));
        }
        if self.config.channel_buffer_size() == 0 {
            return Err(PipelineError::configuration(
                "チャンネルバッファサイズは1以上である必要があります",
            ));
        }
        let sink = self.sink.ok_or_else(|| {
            PipelineError::configuration("シンクが指定されていません")
        })?;
        if self.topology == Topology::Balanced && self.balanced_index.is_none() {
            return Err(PipelineError::configuration(
                "バランス型トポロジには balanced_stage の指定が必要です",
            ));
        }

        let boundaries = build_boundaries(self.topology, &self.stages, self.balanced_index);

        Ok(Pipeline {
            config: self.config,
            topology: self.topology,
            stages: self.stages,
            balanced_index: self.balanced_index,
            sink,
            observer: self.observer,
            on_error: Mutex::new(self.on_error),
            cancel: CancelHandle::new(),
            statistics: Arc::new(Mutex::new(RunStatistics::new())),
            boundaries,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }
}

/// ステージ間チャンネルの一覧(名前つき深度ゲージ)を構築
fn build_boundaries<T>(
    topology: Topology,
    stages: &[StageSpec<T>],
    balanced_index: Option<usize>,
) -> Vec<(String, QueueDepthGauge)> {
    if topology == Topology::Sequential {
        // 逐次実行ではキュー深度に意味がない
        return Vec::new();
    }

    let mut names = Vec::new();
    let mut prev = "source".to_string();
    for (index, spec) in stages.iter().enumerate() {
        if topology == Topology::Balanced && balanced_index == Some(index) {
            names.push(format!("{prev} -> {}", spec.name));
            names.push(format!("{} workers", spec.name));
            names.push(format!("{} -> multiplexer", spec.name));
            prev = "multiplexer".to_string();
        } else {
            names.push(format!("{prev} -> {}", spec.name));
            prev = spec.name.clone();
        }
    }
    names.push(format!("{prev} -> sink"));

    names
        .into_iter()
        .map(|name| (name, QueueDepthGauge::new()))
        .collect()
}

/// 組み立て済みパイプライン
///
/// Governorや順序復元などの実行時部品は `run` のたびに作り直される。
/// 1つのインスタンスは論理的に1回の実行を担う(キャンセルや捕捉済み
/// エラーは実行をまたいで引き継がない設計のため、実行ごとに
/// ビルダーから作り直すことを推奨する)。
pub struct Pipeline<T: Send + 'static> {
    config: Arc<dyn PipelineConfig>,
    topology: Topology,
    stages: Vec<StageSpec<T>>,
    balanced_index: Option<usize>,
    sink: Arc<dyn ItemSink<T>>,
    observer: Arc<dyn PipelineObserver>,
    on_error: Mutex<Option<ErrorCallback>>,
    cancel: CancelHandle,
    statistics: Arc<Mutex<RunStatistics>>,
    boundaries: Vec<(String, QueueDepthGauge)>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// どのスレッドからでも呼べるキャンセルハンドルを取得
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// ステージ間チャンネルごとの滞留アイテム数(診断用・非権威値)
    pub fn queue_depths(&self) -> Vec<(String, usize)> {
        self.boundaries
            .iter()
            .map(|(name, gauge)| (name.clone(), gauge.current()))
            .collect()
    }

    /// 現在パイプライン内にあるアイテム数(診断用)
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// この実行中に同時に存在したアイテム数の最大値(診断用)
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    /// 実行統計のスナップショットを取得
    pub fn statistics(&self) -> RunStatistics {
        self.statistics
            .lock()
            .expect("statistics lock poisoned")
            .clone()
    }

    /// ソースが尽きるかキャンセルされるまでパイプラインを駆動する
    ///
    /// 停止手順が完了する(番兵が全ステージを通過し、全スロットが
    /// 返却される)まで戻らない。
    pub async fn run<S>(&self, source: S) -> PipelineResult<RunSummary>
    where
        S: ItemSource<T>,
    {
        let started = Instant::now();
        self.statistics
            .lock()
            .expect("statistics lock poisoned")
            .reset();
        for (_, gauge) in &self.boundaries {
            gauge.reset();
        }
        self.observer.run_started().await;

        let summary = match self.topology {
            Topology::Sequential => self.run_sequential(source, started).await?,
            Topology::Linear | Topology::Balanced => self.run_dataflow(source, started).await?,
        };

        self.observer.run_completed(&summary).await;
        Ok(summary)
    }

    /// 並行性なしの単一ループ実行
    async fn run_sequential<S>(&self, mut source: S, started: Instant) -> PipelineResult<RunSummary>
    where
        S: ItemSource<T>,
    {
        let mut governor = PipelineGovernor::with_gauges(
            self.config.pipeline_capacity(),
            Arc::clone(&self.in_flight),
            Arc::clone(&self.peak_in_flight),
        );
        let governor_handle = governor.handle();
        let (errors, error_rx) = error_channel();
        let callback = self.on_error.lock().expect("on_error lock poisoned").take();
        let monitor = spawn_error_monitor(
            error_rx,
            self.cancel.clone(),
            Arc::clone(&self.observer),
            callback,
        );
        let cancel = self.cancel.watch();

        let mut sequence = FIRST_SEQUENCE;
        let mut admitted = 0u64;
        let mut completed = 0u64;
        let mut failed = 0u64;
        let mut skipped = 0u64;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let (name, payload) = match source.next_item().await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(error) => {
                    self.cancel.cancel();
                    errors.report(ErrorRecord::new("source", "", None, error.to_string()));
                    break;
                }
            };

            governor.wait_for_slot().await;
            let mut item = WorkItem::new(sequence, name, payload);
            sequence += 1;
            admitted += 1;

            let mut dropped = false;
            for spec in &self.stages {
                if cancel.is_cancelled() {
                    break;
                }
                item.perf.phase_start(&spec.name);
                match spec.transform.apply(&mut item).await {
                    Ok(()) => item.perf.phase_end(),
                    Err(error) => {
                        // 失敗は直ちに停止要求へ変換する(次の投入前に観測される)
                        self.cancel.cancel();
                        errors.report(ErrorRecord::new(
                            &spec.name,
                            item.name(),
                            Some(item.sequence()),
                            error.to_string(),
                        ));
                        failed += 1;
                        dropped = true;
                        break;
                    }
                }
            }

            if dropped {
                governor_handle.free_slot();
                continue;
            }
            if cancel.is_cancelled() {
                skipped += 1;
                governor_handle.free_slot();
                continue;
            }

            item.perf.phase_start("sink");
            let outcome = self.sink.consume(&mut item).await;
            item.perf.phase_end();
            match outcome {
                Ok(()) => {
                    completed += 1;
                    self.statistics
                        .lock()
                        .expect("statistics lock poisoned")
                        .record(&item.perf);
                    self.observer.item_completed(item.sequence(), &item.perf).await;
                }
                Err(error) => {
                    failed += 1;
                    self.cancel.cancel();
                    errors.report(ErrorRecord::new(
                        "sink",
                        item.name(),
                        Some(item.sequence()),
                        error.to_string(),
                    ));
                }
            }
            governor_handle.free_slot();
        }

        governor.wait_for_empty().await;
        drop(errors);
        let first_error = monitor.await.map_err(PipelineError::task)?;

        Ok(self.summarize(started, admitted, completed, failed, skipped, first_error))
    }

    /// チャンネル連結によるデータフロー実行(Linear / Balanced)
    async fn run_dataflow<S>(&self, mut source: S, started: Instant) -> PipelineResult<RunSummary>
    where
        S: ItemSource<T>,
    {
        let buffer = self.config.channel_buffer_size();
        let worker_count = match self.topology {
            Topology::Balanced => self.config.worker_count(),
            _ => 1,
        };

        let mut governor = PipelineGovernor::with_gauges(
            self.config.pipeline_capacity(),
            Arc::clone(&self.in_flight),
            Arc::clone(&self.peak_in_flight),
        );
        let (errors, error_rx) = error_channel();
        let callback = self.on_error.lock().expect("on_error lock poisoned").take();
        let monitor = spawn_error_monitor(
            error_rx,
            self.cancel.clone(),
            Arc::clone(&self.observer),
            callback,
        );
        let counters = SinkCounters::new();

        // ステージ配線: 先頭チャンネルから順にワーカーを連結していく
        let mut handles: Vec<JoinHandle<PipelineResult<()>>> = Vec::new();
        let mut gauge_cursor = 0usize;
        let (head_tx, mut current_rx) = mpsc::channel::<Message<T>>(buffer);
        let head_gauge = self.boundary_gauge(0);

        for (index, spec) in self.stages.iter().enumerate() {
            if self.topology == Topology::Balanced && self.balanced_index == Some(index) {
                let dispatch_gauge = self.boundary_gauge(gauge_cursor);
                let worker_gauge = self.boundary_gauge(gauge_cursor + 1);
                let mux_in_gauge = self.boundary_gauge(gauge_cursor + 2);
                let mux_out_gauge = self.boundary_gauge(gauge_cursor + 3);

                let (mux_tx, mux_rx) = mpsc::channel(buffer);
                let mut worker_txs = Vec::with_capacity(worker_count);
                for _ in 0..worker_count {
                    let (worker_tx, worker_rx) = mpsc::channel(buffer);
                    worker_txs.push(worker_tx);
                    let ctx = StageContext {
                        name: spec.name.clone(),
                        cancel: self.cancel.clone(),
                        errors: errors.clone(),
                        governor: governor.handle(),
                        depth_in: worker_gauge.clone(),
                        depth_out: mux_in_gauge.clone(),
                    };
                    handles.push(spawn_transform_stage(
                        ctx,
                        Arc::clone(&spec.transform),
                        worker_rx,
                        mux_tx.clone(),
                    ));
                }
                drop(mux_tx);

                handles.push(spawn_round_robin_dispatcher(
                    current_rx,
                    worker_txs,
                    dispatch_gauge,
                    worker_gauge,
                ));

                let (next_tx, next_rx) = mpsc::channel(buffer);
                handles.push(spawn_multiplexer(
                    mux_rx,
                    worker_count,
                    next_tx,
                    errors.clone(),
                    mux_in_gauge,
                    mux_out_gauge,
                ));
                current_rx = next_rx;
                gauge_cursor += 3;
            } else {
                let ctx = StageContext {
                    name: spec.name.clone(),
                    cancel: self.cancel.clone(),
                    errors: errors.clone(),
                    governor: governor.handle(),
                    depth_in: self.boundary_gauge(gauge_cursor),
                    depth_out: self.boundary_gauge(gauge_cursor + 1),
                };
                let (next_tx, next_rx) = mpsc::channel(buffer);
                handles.push(spawn_transform_stage(
                    ctx,
                    Arc::clone(&spec.transform),
                    current_rx,
                    next_tx,
                ));
                current_rx = next_rx;
                gauge_cursor += 1;
            }
        }

        let sink_ctx = StageContext {
            name: "sink".to_string(),
            cancel: self.cancel.clone(),
            errors: errors.clone(),
            governor: governor.handle(),
            depth_in: self.boundary_gauge(gauge_cursor),
            depth_out: None,
        };
        let sink_handle = spawn_sink_stage(
            sink_ctx,
            Arc::clone(&self.sink),
            current_rx,
            counters.clone(),
            Arc::clone(&self.observer),
            Arc::clone(&self.statistics),
        );

        // 駆動ループ: 投入前に必ずスロットを確保する
        let cancel = self.cancel.watch();
        let mut sequence = FIRST_SEQUENCE;
        let mut admitted = 0u64;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let (name, payload) = match source.next_item().await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(error) => {
                    self.cancel.cancel();
                    errors.report(ErrorRecord::new("source", "", None, error.to_string()));
                    break;
                }
            };

            governor.wait_for_slot().await;
            let item = WorkItem::new(sequence, name, payload);
            if let Some(gauge) = &head_gauge {
                gauge.increment();
            }
            if head_tx.send(Message::Item(item)).await.is_err() {
                // 先頭ステージが消えている: 取得済みスロットを戻して終了へ
                governor.handle().free_slot();
                errors.report(ErrorRecord::new(
                    "driver",
                    "",
                    Some(sequence),
                    "先頭ステージの入力チャンネルが閉じられました",
                ));
                break;
            }
            sequence += 1;
            admitted += 1;
        }

        // 流れているアイテムが全て掃けるのを待ってから番兵を流す
        governor.wait_for_empty().await;
        let _ = head_tx.send(Message::End).await;
        drop(head_tx);

        let mut stage_failure: Option<PipelineError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    if stage_failure.is_none() {
                        stage_failure = Some(error);
                    }
                }
                Err(join_error) => {
                    if stage_failure.is_none() {
                        stage_failure = Some(PipelineError::task(join_error));
                    }
                }
            }
        }
        sink_handle.await??;

        drop(errors);
        let first_error = monitor.await.map_err(PipelineError::task)?;

        if let Some(error) = stage_failure {
            return Err(error);
        }

        Ok(self.summarize(
            started,
            admitted,
            counters.completed(),
            counters.failed(),
            counters.skipped(),
            first_error,
        ))
    }

    fn boundary_gauge(&self, index: usize) -> Option<QueueDepthGauge> {
        self.boundaries.get(index).map(|(_, gauge)| gauge.clone())
    }

    fn summarize(
        &self,
        started: Instant,
        admitted: u64,
        completed: u64,
        failed: u64,
        skipped: u64,
        first_error: Option<ErrorRecord>,
    ) -> RunSummary {
        let total_elapsed_ms = started.elapsed().as_millis() as u64;
        let average_time_per_item_ms = if completed > 0 {
            total_elapsed_ms as f64 / completed as f64
        } else {
            0.0
        };
        RunSummary {
            admitted,
            completed,
            failed,
            skipped,
            was_cancelled: self.cancel.is_cancelled(),
            first_error,
            total_elapsed_ms,
            average_time_per_item_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::config::DefaultPipelineConfig;
    use crate::services::sinks::CollectingSink;
    use crate::services::sources::InMemorySource;

    fn numbers(count: u64) -> InMemorySource<u64> {
        InMemorySource::from_payloads((0..count).collect())
    }

    #[test]
    fn test_builder_rejects_zero_capacity() {
        let config = DefaultPipelineConfig::default().with_capacity(0);
        let result = PipelineBuilder::<u64>::new(config)
            .sink(Arc::new(CollectingSink::new()))
            .build();

        assert!(matches!(
            result,
            Err(PipelineError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn test_builder_rejects_missing_sink() {
        let result = PipelineBuilder::<u64>::new(DefaultPipelineConfig::default()).build();

        assert!(matches!(
            result,
            Err(PipelineError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn test_builder_rejects_balanced_without_balanced_stage() {
        let result = PipelineBuilder::<u64>::new(DefaultPipelineConfig::default())
            .topology(Topology::Balanced)
            .stage_fn("noop", |_| Ok(()))
            .sink(Arc::new(CollectingSink::new()))
            .build();

        assert!(matches!(
            result,
            Err(PipelineError::ConfigurationError { .. })
        ));
    }

    #[tokio::test]
    async fn test_sequential_run_processes_in_order() {
        let sink = Arc::new(CollectingSink::new());
        let pipeline = PipelineBuilder::<u64>::new(DefaultPipelineConfig::default())
            .topology(Topology::Sequential)
            .stage_fn("double", |item| {
                item.payload *= 2;
                Ok(())
            })
            .sink(sink.clone())
            .build()
            .unwrap();

        let summary = pipeline.run(numbers(5)).await.unwrap();

        assert_eq!(summary.admitted, 5);
        assert_eq!(summary.completed, 5);
        assert_eq!(summary.failed, 0);
        assert!(!summary.was_cancelled);
        assert_eq!(sink.sequences(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_linear_run_preserves_channel_order() {
        let sink = Arc::new(CollectingSink::new());
        let pipeline = PipelineBuilder::<u64>::new(
            DefaultPipelineConfig::default().with_capacity(4),
        )
        .topology(Topology::Linear)
        .stage_fn("add", |item| {
            item.payload += 1;
            Ok(())
        })
        .stage_fn("double", |item| {
            item.payload *= 2;
            Ok(())
        })
        .sink(sink.clone())
        .build()
        .unwrap();

        let summary = pipeline.run(numbers(20)).await.unwrap();

        assert_eq!(summary.completed, 20);
        assert_eq!(sink.sequences(), (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_balanced_run_restores_order() {
        let sink = Arc::new(CollectingSink::new());
        let pipeline = PipelineBuilder::<u64>::new(
            DefaultPipelineConfig::default()
                .with_capacity(8)
                .with_worker_count(4),
        )
        .topology(Topology::Balanced)
        .balanced_stage(
            "noop",
            Arc::new(FnTransform::new(|_: &mut WorkItem<u64>| -> anyhow::Result<()> { Ok(()) })),
        )
        .sink(sink.clone())
        .build()
        .unwrap();

        let summary = pipeline.run(numbers(50)).await.unwrap();

        assert_eq!(summary.completed, 50);
        assert_eq!(sink.sequences(), (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_queue_depth_boundaries_are_named() {
        let pipeline = PipelineBuilder::<u64>::new(
            DefaultPipelineConfig::default().with_worker_count(2),
        )
        .topology(Topology::Balanced)
        .stage_fn("scale", |_| Ok(()))
        .balanced_stage(
            "filter",
            Arc::new(FnTransform::new(|_: &mut WorkItem<u64>| -> anyhow::Result<()> { Ok(()) })),
        )
        .sink(Arc::new(CollectingSink::new()))
        .build()
        .unwrap();

        let depths = pipeline.queue_depths();
        let names: Vec<&str> = depths.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "source -> scale",
                "scale -> filter",
                "filter workers",
                "filter -> multiplexer",
                "multiplexer -> sink",
            ]
        );
        // 実行前は全て空
        assert!(depths.iter().all(|(_, depth)| *depth == 0));
    }

    #[tokio::test]
    async fn test_sequential_topology_has_no_boundaries() {
        let pipeline = PipelineBuilder::<u64>::new(DefaultPipelineConfig::default())
            .topology(Topology::Sequential)
            .stage_fn("noop", |_| Ok(()))
            .sink(Arc::new(CollectingSink::new()))
            .build()
            .unwrap();

        assert!(pipeline.queue_depths().is_empty());
    }

    #[tokio::test]
    async fn test_peak_in_flight_respects_capacity() {
        let sink = Arc::new(CollectingSink::new());
        let pipeline = PipelineBuilder::<u64>::new(
            DefaultPipelineConfig::default().with_capacity(3),
        )
        .topology(Topology::Linear)
        .stage_fn("noop", |_| Ok(()))
        .sink(sink.clone())
        .build()
        .unwrap();

        pipeline.run(numbers(30)).await.unwrap();

        assert!(pipeline.peak_in_flight() <= 3);
        assert_eq!(pipeline.in_flight(), 0);
    }
}
