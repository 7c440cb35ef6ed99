use std::fmt;

/// 同步事件对账错误
///
/// 控制器（`on_receipt` / `on_sync` / `on_response`）在边界处吞掉这些错误并记录日志，
/// 传输层永远只看到已结算的结果。
#[derive(Debug, thiserror::Error)]
pub enum SyncEventError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Batch error: {0}")]
    Batch(String),
}

impl SyncEventError {
    /// 创建存储层错误
    pub fn storage<T: fmt::Display>(msg: T) -> Self {
        Self::Storage(msg.to_string())
    }

    /// 创建批处理错误
    pub fn batch<T: fmt::Display>(msg: T) -> Self {
        Self::Batch(msg.to_string())
    }

    /// 是否为存储相关的错误（SQLite / 序列化 / 存储协作方）
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            SyncEventError::Sqlite(_) | SyncEventError::Json(_) | SyncEventError::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncEventError>;
