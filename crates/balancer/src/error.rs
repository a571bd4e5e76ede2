//! Balancer error types.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BalancerError>;

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Metrics encoding failed: {0}")]
    Metrics(#[from] std::fmt::Error),
}

impl BalancerError {
    pub fn config(msg: impl std::fmt::Display) -> Self {
        BalancerError::Config(msg.to_string())
    }
}
