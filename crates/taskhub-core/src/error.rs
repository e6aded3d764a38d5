//! TaskHub error types.

use thiserror::Error;

/// Errors surfaced by the broker, the scheduler and the stores.
///
/// Unknown ids are not errors: management calls report them as
/// `Ok(false)` / `Ok(None)`.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Malformed rule combination, bad cron syntax, or a rule that can never fire.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A background loop was started outside a tokio runtime.
    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl DispatchError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidSchedule(msg.into())
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
