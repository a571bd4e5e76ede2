//! Common error types for rip-server components.

use std::fmt;

/// A specialized Result type for shared operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for shared operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("PID record error: {0}")]
    PidRecord(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new PID record error.
    pub fn pid_record(msg: impl fmt::Display) -> Self {
        Error::PidRecord(msg.to_string())
    }

    /// Create a new invalid value error.
    pub fn invalid_value(msg: impl fmt::Display) -> Self {
        Error::InvalidValue(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}
