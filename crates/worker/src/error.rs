//! Worker error types.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load application: {0}")]
    Load(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("Invalid arguments: {0}")]
    Args(String),

    #[error("Control socket error: {0}")]
    Control(String),
}

impl WorkerError {
    pub fn load(msg: impl std::fmt::Display) -> Self {
        WorkerError::Load(msg.to_string())
    }

    pub fn handler(msg: impl std::fmt::Display) -> Self {
        WorkerError::Handler(msg.to_string())
    }

    pub fn args(msg: impl std::fmt::Display) -> Self {
        WorkerError::Args(msg.to_string())
    }
}
