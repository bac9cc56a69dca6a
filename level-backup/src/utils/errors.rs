//! Custom error types for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The dataset's own save routine failed.
    #[error("Dataset flush failed: {0:#}")]
    Flush(anyhow::Error),

    #[error("Failed to read snapshot tree at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive packing failed: {0}")]
    Pack(#[from] zip::result::ZipError),

    #[error("Failed to write archive {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not delete old backup {path}: {source}")]
    Eviction {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backups are disabled: {0}")]
    Disabled(String),

    #[error("Backup cancelled")]
    Cancelled,

    #[error("Dataset lock poisoned")]
    DatasetPoisoned,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl BackupError {
    /// Cancellation is logged quietly, everything else with full detail.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled)
    }
}

impl From<config::ConfigError> for BackupError {
    fn from(err: config::ConfigError) -> Self {
        BackupError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
