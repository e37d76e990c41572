//! # Storage Error Types
//!
//! 定义存储系统相关的错误类型。

use parley_core::ChatId;
use thiserror::Error;

/// 存储错误类型
#[derive(Error, Debug)]
pub enum StorageError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化/反序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 会话不存在
    #[error("Chat not found: {id}")]
    ChatNotFound { id: ChatId },

    /// 其他错误
    #[error("Storage error: {message}")]
    Other { message: String },
}

impl StorageError {
    /// 创建其他错误
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ChatNotFound { .. })
    }
}

/// 存储结果类型
pub type StorageResult<T> = Result<T, StorageError>;
