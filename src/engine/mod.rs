// エンジン層 - パイプラインの実行機構
// 容量統制・ステージ・順序復元・キャンセル伝播・トポロジ組み立て

pub mod balancer;
pub mod cancel;
pub mod failure;
pub mod governor;
pub mod multiplexer;
pub mod pipeline;
pub mod stage;

// 公開API - 主要な実行部品を明示的にエクスポート
pub use cancel::{CancelHandle, CancelWatch};
pub use failure::{error_channel, spawn_error_monitor, ErrorCallback, ErrorReporter};
pub use governor::{GovernorHandle, PipelineGovernor};
pub use pipeline::{Pipeline, PipelineBuilder, Topology};
pub use stage::{SinkCounters, StageContext};
