//! Error types for the simulation harness.

use rigsync_core::{ConfigurationError, HistoryError, LogError, SyncError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No config.json in {0} and no fallback config given")]
    MissingConfig(PathBuf),

    #[error("Session task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for SimError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
