pub mod cli;
pub mod core;
pub mod engine;
pub mod imaging;
pub mod services;

// 主要APIの再エクスポート
// ライブラリ利用者はここから組み立てに必要な型一式を取得できる
pub use crate::core::{
    ErrorRecord, FnTransform, ItemSink, ItemSource, Message, PerformanceRecord, PipelineConfig,
    PipelineError, PipelineObserver, PipelineResult, RunSummary, Transform, WorkItem,
    FIRST_SEQUENCE,
};
pub use crate::engine::{CancelHandle, Pipeline, PipelineBuilder, Topology};
pub use crate::services::{
    CollectingSink, ConsolePipelineObserver, CyclingSource, DefaultPipelineConfig, InMemorySource,
    NoOpPipelineObserver, NullSink, RunStatistics,
};
