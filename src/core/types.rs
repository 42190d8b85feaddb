// パイプラインを流れるデータ型定義

use std::time::Instant;

/// 最初に投入されるアイテムのシーケンス番号
pub const FIRST_SEQUENCE: u64 = 1;

/// 1フェーズ分の処理時間記録(診断用)
///
/// 時刻はアイテム投入時点からのオフセット(マイクロ秒)で保持する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSpan {
    pub stage: String,
    pub started_us: u64,
    pub ended_us: u64,
}

impl PhaseSpan {
    /// フェーズの実処理時間(マイクロ秒)
    pub fn busy_us(&self) -> u64 {
        self.ended_us.saturating_sub(self.started_us)
    }
}

/// アイテム単位の性能記録
///
/// 各ステージが開始・終了を打刻する。動作には一切影響しない診断専用データ。
#[derive(Debug, Clone)]
pub struct PerformanceRecord {
    origin: Instant,
    spans: Vec<PhaseSpan>,
}

impl PerformanceRecord {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            spans: Vec::new(),
        }
    }

    fn offset_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    /// フェーズ開始を打刻
    pub fn phase_start(&mut self, stage: &str) {
        let now = self.offset_us();
        self.spans.push(PhaseSpan {
            stage: stage.to_string(),
            started_us: now,
            ended_us: now,
        });
    }

    /// 直近に開始したフェーズの終了を打刻
    pub fn phase_end(&mut self) {
        let now = self.offset_us();
        if let Some(span) = self.spans.last_mut() {
            span.ended_us = now;
        }
    }

    pub fn spans(&self) -> &[PhaseSpan] {
        &self.spans
    }

    /// 投入から最後のフェーズ終了までの経過時間(マイクロ秒)
    pub fn total_elapsed_us(&self) -> u64 {
        self.spans.last().map(|s| s.ended_us).unwrap_or(0)
    }

    /// 指定ステージの実処理時間(マイクロ秒)
    pub fn stage_busy_us(&self, stage: &str) -> Option<u64> {
        self.spans
            .iter()
            .find(|s| s.stage == stage)
            .map(PhaseSpan::busy_us)
    }
}

impl Default for PerformanceRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// パイプラインを流れる作業アイテム
///
/// シーケンス番号は投入時に採番され不変。ペイロードの所有権は
/// チャンネル送信のたびに保持ステージへ移動する。
#[derive(Debug)]
pub struct WorkItem<T> {
    sequence: u64,
    name: String,
    pub payload: T,
    pub perf: PerformanceRecord,
}

impl<T> WorkItem<T> {
    pub fn new(sequence: u64, name: impl Into<String>, payload: T) -> Self {
        Self {
            sequence,
            name: name.into(),
            payload,
            perf: PerformanceRecord::new(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// ステージ間メッセージ
///
/// `End` は番兵。各ステージは停止前に必ず1つだけ下流へ転送する。
/// `Dropped` は変換失敗で取り除かれたアイテムの占位通知で、
/// 多重化器の欠番を防ぐためにシーケンス番号だけが下流へ流れる。
#[derive(Debug)]
pub enum Message<T> {
    Item(WorkItem<T>),
    Dropped(u64),
    End,
}

/// 失敗1件分の記録
///
/// 1回の実行で呼び出し元へ引き渡されるのは最初の1件のみ。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorRecord {
    pub stage: String,
    pub item: String,
    pub sequence: Option<u64>,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(
        stage: impl Into<String>,
        item: impl Into<String>,
        sequence: Option<u64>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            item: item.into(),
            sequence,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.sequence {
            Some(seq) => write!(
                f,
                "stage '{}' failed on item '{}' (#{}): {}",
                self.stage, self.item, seq, self.message
            ),
            None => write!(
                f,
                "stage '{}' failed on item '{}': {}",
                self.stage, self.item, self.message
            ),
        }
    }
}

/// 実行全体のサマリー
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RunSummary {
    /// パイプラインへ投入されたアイテム数
    pub admitted: u64,
    /// シンクまで到達して消費されたアイテム数
    pub completed: u64,
    /// 変換失敗で取り除かれたアイテム数
    pub failed: u64,
    /// キャンセル後にドレインで素通りしたアイテム数
    pub skipped: u64,
    pub was_cancelled: bool,
    pub first_error: Option<ErrorRecord>,
    pub total_elapsed_ms: u64,
    pub average_time_per_item_ms: f64,
}
