//! Error types for blockvault

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for blockvault operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("error probing size of {path}: {reason}")]
    DeviceProbe { path: PathBuf, reason: String },

    #[error("backup not found: {id}")]
    BackupNotFound { id: i64 },

    #[error("no full backup exists for volume {volume_id}")]
    MissingFullBackup { volume_id: i64 },

    #[error("integrity verification failed: {reason}")]
    Integrity { reason: String },
}

impl Error {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }
}

/// Result type alias for blockvault operations
pub type Result<T> = std::result::Result<T, Error>;
