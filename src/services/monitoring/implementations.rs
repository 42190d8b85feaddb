// 実行監視の具象実装

use crate::core::{ErrorRecord, PerformanceRecord, PipelineObserver, RunSummary};
use async_trait::async_trait;

/// コンソール出力による監視実装
#[derive(Debug, Default, Clone)]
pub struct ConsolePipelineObserver {
    quiet: bool,
}

impl ConsolePipelineObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quiet() -> Self {
        Self { quiet: true }
    }
}

#[async_trait]
impl PipelineObserver for ConsolePipelineObserver {
    async fn run_started(&self) {
        if !self.quiet {
            println!("🚀 Pipeline run started");
        }
    }

    async fn item_completed(&self, sequence: u64, perf: &PerformanceRecord) {
        if !self.quiet && sequence % 100 == 0 {
            println!(
                "📊 Item #{sequence} completed ({:.1}ms in pipeline)",
                perf.total_elapsed_us() as f64 / 1000.0
            );
        }
    }

    async fn item_failed(&self, record: &ErrorRecord) {
        if !self.quiet {
            eprintln!("❌ {record}");
        }
    }

    async fn run_completed(&self, summary: &RunSummary) {
        if !self.quiet {
            println!(
                "✅ Run finished: {} completed, {} failed, {} skipped (cancelled: {})",
                summary.completed, summary.failed, summary.skipped, summary.was_cancelled
            );
        }
    }
}

/// 何もしない監視実装(テスト・ベンチマーク用)
#[derive(Debug, Default, Clone)]
pub struct NoOpPipelineObserver;

impl NoOpPipelineObserver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PipelineObserver for NoOpPipelineObserver {
    async fn run_started(&self) {
        // 何もしない
    }

    async fn item_completed(&self, _sequence: u64, _perf: &PerformanceRecord) {
        // 何もしない
    }

    async fn item_failed(&self, _record: &ErrorRecord) {
        // 何もしない
    }

    async fn run_completed(&self, _summary: &RunSummary) {
        // 何もしない
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> RunSummary {
        RunSummary {
            admitted: 10,
            completed: 9,
            failed: 1,
            skipped: 0,
            was_cancelled: true,
            first_error: None,
            total_elapsed_ms: 120,
            average_time_per_item_ms: 13.3,
        }
    }

    #[tokio::test]
    async fn test_console_observer_calls_do_not_panic() {
        // 出力キャプチャは複雑なため、基本的な呼び出しテストのみ
        let observer = ConsolePipelineObserver::quiet();

        observer.run_started().await;
        observer
            .item_completed(100, &PerformanceRecord::new())
            .await;
        observer
            .item_failed(&ErrorRecord::new("filter", "a.jpg", Some(1), "failed"))
            .await;
        observer.run_completed(&summary()).await;
    }

    #[tokio::test]
    async fn test_noop_observer_calls_do_not_panic() {
        let observer = NoOpPipelineObserver::new();

        observer.run_started().await;
        observer.item_completed(1, &PerformanceRecord::new()).await;
        observer.run_completed(&summary()).await;
    }
}
