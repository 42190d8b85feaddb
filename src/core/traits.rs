// パイプラインのトレイト定義
// 変換・入出力・監視・設定の抽象化インターフェースを定義

use super::types::{ErrorRecord, PerformanceRecord, RunSummary, WorkItem};
use anyhow::Result;
use async_trait::async_trait;
use mockall::automock;

/// アイテム変換の抽象化トレイト
///
/// 各ステージに外部から注入される処理本体。アイテムを直接書き換え、
/// 失敗時はエラーを返す。失敗したアイテムはステージ側で取り除かれる。
#[async_trait]
pub trait Transform<T: Send + 'static>: Send + Sync {
    async fn apply(&self, item: &mut WorkItem<T>) -> Result<()>;
}

/// 同期クロージャをTransformとして使うためのアダプタ
///
/// テストや軽量な変換向け。待機を伴う変換は直接Transformを実装する。
pub struct FnTransform<F> {
    func: F,
}

impl<F> FnTransform<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<T, F> Transform<T> for FnTransform<F>
where
    T: Send + 'static,
    F: Fn(&mut WorkItem<T>) -> Result<()> + Send + Sync,
{
    async fn apply(&self, item: &mut WorkItem<T>) -> Result<()> {
        (self.func)(item)
    }
}

/// アイテム供給源の抽象化トレイト
///
/// 遅延シーケンス。`None` で枯渇を通知する。無限に供給し続けてもよく、
/// その場合はキャンセルだけが実行を止める。
#[async_trait]
pub trait ItemSource<T: Send + 'static>: Send {
    /// 次のアイテム(表示名とペイロード)を取り出す
    async fn next_item(&mut self) -> Result<Option<(String, T)>>;
}

/// 終端シンクの抽象化トレイト
///
/// アイテムはシンク消費後に破棄される。
#[async_trait]
pub trait ItemSink<T: Send + 'static>: Send + Sync {
    async fn consume(&self, item: &mut WorkItem<T>) -> Result<()>;
}

/// 実行監視の抽象化トレイト
#[automock]
#[async_trait]
pub trait PipelineObserver: Send + Sync {
    /// 実行開始時の通知
    async fn run_started(&self);

    /// アイテム1件がシンクまで到達した時の通知
    async fn item_completed(&self, sequence: u64, perf: &PerformanceRecord);

    /// アイテム1件の失敗通知(2件目以降もここへは届く)
    async fn item_failed(&self, record: &ErrorRecord);

    /// 実行完了時の通知
    async fn run_completed(&self, summary: &RunSummary);
}

/// パイプライン設定の抽象化トレイト
#[automock]
pub trait PipelineConfig: Send + Sync {
    /// 同時に流せるアイテム数の上限
    fn pipeline_capacity(&self) -> usize;

    /// 並列化されたステージのワーカー数
    fn worker_count(&self) -> usize;

    /// ステージ間チャンネルのバッファサイズ
    fn channel_buffer_size(&self) -> usize;

    /// 進捗報告を有効にするかどうか
    fn enable_progress_reporting(&self) -> bool;
}

// PipelineConfig for Box<dyn PipelineConfig>
impl PipelineConfig for Box<dyn PipelineConfig> {
    fn pipeline_capacity(&self) -> usize {
        self.as_ref().pipeline_capacity()
    }

    fn worker_count(&self) -> usize {
        self.as_ref().worker_count()
    }

    fn channel_buffer_size(&self) -> usize {
        self.as_ref().channel_buffer_size()
    }

    fn enable_progress_reporting(&self) -> bool {
        self.as_ref().enable_progress_reporting()
    }
}
