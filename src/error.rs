use thiserror::Error;

/// 会话管理错误
///
/// "已在运行" 不是错误，通过 `StartOutcome::already_running` 返回。
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn transcoder for session [{key}]: {reason}")]
    SpawnFailed { key: String, reason: String },

    #[error("invalid session key [{0}]")]
    InvalidKey(String),

    #[error("session [{0}] not found")]
    NotFound(String),

    #[error("session limit reached ({0} active)")]
    CapacityExceeded(usize),

    #[error("insufficient system memory ({0} KB available)")]
    InsufficientMemory(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
