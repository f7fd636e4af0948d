//! 错误定义模块

use thiserror::Error;

/// PACS系统统一错误类型
#[derive(Error, Debug)]
pub enum PacsError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    /// 属性blob无法解码，不可在本地恢复
    #[error("属性数据损坏: {0}")]
    BlobCorrupted(String),

    /// 乐观并发冲突，调用方可重试
    #[error("并发冲突: {0}")]
    Conflict(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },
}

impl PacsError {
    pub fn not_found(what: impl Into<String>) -> Self {
        PacsError::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        PacsError::Conflict(what.into())
    }

    /// 调用方是否可以在新的事务中重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, PacsError::Conflict(_))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for PacsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => PacsError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure / deadlock_detected
                Some("40001") | Some("40P01") => PacsError::Conflict(db.message().to_string()),
                _ => PacsError::Database(db.message().to_string()),
            },
            other => PacsError::Database(other.to_string()),
        }
    }
}

/// PACS系统统一结果类型
pub type Result<T> = std::result::Result<T, PacsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflict_is_retryable() {
        assert!(PacsError::conflict("study 1").is_retryable());
        assert!(!PacsError::not_found("study 1").is_retryable());
        assert!(!PacsError::BlobCorrupted("patient 1".into()).is_retryable());
    }
}
