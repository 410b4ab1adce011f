//! Backup artifacts and their on-disk naming.
//!
//! An artifact lives at `<backup_root>/<database>/<created_at>.<kind>.sql.zst`.
//! `created_at` is rendered as `%Y%m%dT%H%M%SZ` so that lexical order of the
//! file names is chronological order.

use crate::utils::errors::ChainIntegrityError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";
pub const ARTIFACT_EXTENSION: &str = "sql.zst";
pub const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    /// Tag used in file names.
    pub fn tag(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incr",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "full" => Some(BackupKind::Full),
            "incr" => Some(BackupKind::Incremental),
            _ => None,
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Full => write!(f, "full"),
            BackupKind::Incremental => write!(f, "incremental"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub server: String,
    pub database: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    #[serde(default)]
    pub size_bytes: u64,
}

impl BackupArtifact {
    pub fn is_full(&self) -> bool {
        self.kind == BackupKind::Full
    }

    pub fn file_name(&self) -> String {
        artifact_file_name(self.created_at, self.kind)
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn artifact_file_name(created_at: DateTime<Utc>, kind: BackupKind) -> String {
    format!(
        "{}.{}.{}",
        format_timestamp(created_at),
        kind.tag(),
        ARTIFACT_EXTENSION
    )
}

/// Recover `(created_at, kind)` from a file name; `None` for anything that
/// is not a finished artifact.
pub fn parse_file_name(name: &str) -> Option<(DateTime<Utc>, BackupKind)> {
    let stem = name.strip_suffix(&format!(".{}", ARTIFACT_EXTENSION))?;
    let (ts, tag) = stem.split_once('.')?;
    let kind = BackupKind::from_tag(tag)?;
    let created_at = parse_timestamp(ts)?;
    Some((created_at, kind))
}

/// Sort ascending by `created_at`, refusing to order equal timestamps.
pub fn sort_chronologically(
    server: &str,
    database: &str,
    artifacts: &mut [BackupArtifact],
) -> Result<(), ChainIntegrityError> {
    artifacts.sort_by_key(|a| a.created_at);
    if let Some(pair) = artifacts
        .windows(2)
        .find(|pair| pair[0].created_at == pair[1].created_at)
    {
        return Err(ChainIntegrityError::DuplicateTimestamp {
            server: server.to_string(),
            database: database.to_string(),
            created_at: pair[0].created_at,
        });
    }
    Ok(())
}
