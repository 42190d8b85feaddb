// パイプライン専用のカスタムエラー型定義

use thiserror::Error;

/// パイプライン固有のエラー型
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("設定エラー: {message}")]
    ConfigurationError { message: String },

    #[error("チャンネルエラー: {message}")]
    ChannelError { message: String },

    #[error("タスクエラー: {source}")]
    TaskError {
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("シーケンス整合性エラー: {message}")]
    SequenceError { message: String },

    #[error("ソースエラー: {source}")]
    SourceError {
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// 設定エラーの作成
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// チャンネルエラーの作成
    pub fn channel(message: impl Into<String>) -> Self {
        Self::ChannelError {
            message: message.into(),
        }
    }

    /// タスクエラーの作成
    pub fn task(source: tokio::task::JoinError) -> Self {
        Self::TaskError { source }
    }

    /// シーケンス整合性エラーの作成
    ///
    /// 多重化器の順序不変条件が破れた場合にのみ使われる。
    /// 実装欠陥を示すため回復対象にはしない。
    pub fn sequence(message: impl Into<String>) -> Self {
        Self::SequenceError {
            message: message.into(),
        }
    }

    /// ソースエラーの作成
    pub fn source_failure(source: anyhow::Error) -> Self {
        Self::SourceError { source }
    }

    /// 実行を中断すべき致命的エラーかどうか
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SequenceError { .. } | Self::ConfigurationError { .. }
        )
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(error: tokio::task::JoinError) -> Self {
        PipelineError::TaskError { source: error }
    }
}

/// パイプライン処理の結果型
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_creation_and_display() {
        let config_error = PipelineError::configuration("容量は1以上である必要があります");
        assert!(config_error.to_string().contains("設定エラー"));

        let channel_error = PipelineError::channel("下流チャンネルが閉じられました");
        assert!(channel_error.to_string().contains("チャンネルエラー"));

        let sequence_error = PipelineError::sequence("欠番が検出されました");
        assert!(sequence_error.to_string().contains("シーケンス整合性エラー"));

        let source_error = PipelineError::source_failure(anyhow::anyhow!("読み込み失敗"));
        assert!(source_error.to_string().contains("ソースエラー"));
    }

    #[test]
    fn test_error_source_chain() {
        let error = PipelineError::source_failure(anyhow::anyhow!("ルートエラー"));
        assert!(error.source().is_some());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::sequence("重複").is_fatal());
        assert!(PipelineError::configuration("無効").is_fatal());
        assert!(!PipelineError::channel("閉鎖").is_fatal());
        assert!(!PipelineError::source_failure(anyhow::anyhow!("一時的")).is_fatal());
    }

    #[tokio::test]
    async fn test_task_error_conversion() {
        let task = tokio::spawn(async {
            tokio::task::yield_now().await;
            std::future::pending::<()>().await;
        });
        task.abort();

        let join_error = task.await.expect_err("タスクエラーが期待されます");
        let pipeline_error: PipelineError = join_error.into();

        assert!(pipeline_error.to_string().contains("タスクエラー"));
        assert!(!pipeline_error.is_fatal());
    }
}
