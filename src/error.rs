use std::time::Duration;
use thiserror::Error;

/// 存储层错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    #[error("WRONGTYPE operation against key '{key}'")]
    WrongType { key: String },

    #[error("value at key '{key}' is not an integer")]
    NotAnInteger { key: String },

    #[error("unexpected reply to {command}: {detail}")]
    UnexpectedReply {
        command: &'static str,
        detail: String,
    },
}

/// 协调原语错误
#[derive(Debug, Error)]
pub enum CoordError {
    /// 乐观事务在允许的时间窗口内一直被打断
    #[error("optimistic transaction on {keys:?} still contended after {waited:?}")]
    Contention { keys: Vec<String>, waited: Duration },

    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    /// 租约在持有期间已经过期
    #[error("lease on '{name}' was lost")]
    Lost { name: String },

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    #[error("malformed task payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type Result<T, E = CoordError> = std::result::Result<T, E>;
