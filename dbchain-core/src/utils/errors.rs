//! Error taxonomy for backup, restore and pruning.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connectivity error on server {server}: {reason}")]
    Connectivity { server: String, reason: String },

    #[error("Dump of {server}/{database} failed: {reason}")]
    Dump {
        server: String,
        database: String,
        reason: String,
    },

    #[error("Apply to {server}/{database} failed: {reason}")]
    Apply {
        server: String,
        database: String,
        reason: String,
    },

    #[error("Chain integrity error: {0}")]
    ChainIntegrity(#[from] ChainIntegrityError),

    #[error("Run lock {path} is held by pid {pid} on {host}")]
    LockHeld { path: PathBuf, pid: i32, host: String },

    #[error("Command failed: {0}")]
    Command(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Violations of chain lineage. Never resolved by guessing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainIntegrityError {
    #[error("no full backup of {server}/{database} at or before {target}")]
    NoSuitableBaseline {
        server: String,
        database: String,
        target: String,
    },

    #[error("duplicate backup timestamp {created_at} in {server}/{database}")]
    DuplicateTimestamp {
        server: String,
        database: String,
        created_at: DateTime<Utc>,
    },

    #[error("incremental backup {created_at} of {server}/{database} has no preceding full backup")]
    OrphanIncremental {
        server: String,
        database: String,
        created_at: DateTime<Utc>,
    },
}

impl From<rusqlite::Error> for BackupError {
    fn from(err: rusqlite::Error) -> Self {
        BackupError::Store(err.to_string())
    }
}

impl From<r2d2::Error> for BackupError {
    fn from(err: r2d2::Error) -> Self {
        BackupError::Store(err.to_string())
    }
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Config(err.to_string())
    }
}

impl BackupError {
    /// Errors that abort the whole invocation rather than one item.
    pub fn is_hard_abort(&self) -> bool {
        matches!(
            self,
            BackupError::Config(_) | BackupError::LockHeld { .. } | BackupError::Store(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
