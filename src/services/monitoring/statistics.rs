// 実行統計の集計 - ステージ別処理時間とアイテム遅延の平均値
// アイテムごとのPerformanceRecordを終端ステージで積算する

use crate::core::PerformanceRecord;

/// ステージ1つ分の積算値
#[derive(Debug, Clone, PartialEq, Eq)]
struct StageTotal {
    stage: String,
    total_busy_us: u64,
    samples: u64,
}

/// 実行1回分の集計統計
///
/// 終端ステージが完了アイテムごとに `record` を呼ぶ。
/// 新しい実行を始める前に `reset` で破棄する。
#[derive(Debug, Clone, Default)]
pub struct RunStatistics {
    items_recorded: u64,
    total_latency_us: u64,
    stage_totals: Vec<StageTotal>,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.items_recorded = 0;
        self.total_latency_us = 0;
        self.stage_totals.clear();
    }

    /// 完了アイテム1件分の記録を積算する
    pub fn record(&mut self, perf: &PerformanceRecord) {
        self.items_recorded += 1;
        self.total_latency_us += perf.total_elapsed_us();

        for span in perf.spans() {
            match self
                .stage_totals
                .iter_mut()
                .find(|total| total.stage == span.stage)
            {
                Some(total) => {
                    total.total_busy_us += span.busy_us();
                    total.samples += 1;
                }
                None => self.stage_totals.push(StageTotal {
                    stage: span.stage.clone(),
                    total_busy_us: span.busy_us(),
                    samples: 1,
                }),
            }
        }
    }

    pub fn items_recorded(&self) -> u64 {
        self.items_recorded
    }

    /// 指定ステージの平均処理時間(ミリ秒)
    pub fn average_stage_ms(&self, stage: &str) -> Option<f64> {
        self.stage_totals
            .iter()
            .find(|total| total.stage == stage)
            .map(|total| total.total_busy_us as f64 / total.samples as f64 / 1000.0)
    }

    /// 投入からシンク到達までの平均遅延(ミリ秒)
    pub fn average_latency_ms(&self) -> f64 {
        if self.items_recorded == 0 {
            return 0.0;
        }
        self.total_latency_us as f64 / self.items_recorded as f64 / 1000.0
    }

    /// ステージ名と平均処理時間(ミリ秒)の一覧(記録された順)
    pub fn stage_averages(&self) -> Vec<(String, f64)> {
        self.stage_totals
            .iter()
            .map(|total| {
                (
                    total.stage.clone(),
                    total.total_busy_us as f64 / total.samples as f64 / 1000.0,
                )
            })
            .collect()
    }
}
