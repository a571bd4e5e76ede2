//! Manager error types.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker slot {0} is not tracked")]
    UnknownSlot(usize),

    #[error("Worker slot {0} stopped before answering")]
    SlotGone(usize),

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("{0}")]
    Other(String),
}

impl ManagerError {
    pub fn other(msg: impl std::fmt::Display) -> Self {
        ManagerError::Other(msg.to_string())
    }
}
