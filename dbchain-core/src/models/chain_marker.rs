use crate::models::artifact::{format_timestamp, parse_timestamp, BackupArtifact, BackupKind};
use crate::utils::errors::ChainIntegrityError;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Latest full and latest backup of any kind for one (server, database).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMarker {
    pub server: String,
    pub database: String,
    pub last_full: DateTime<Utc>,
    pub last_any: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChainMarker {
    /// Marker after a successful backup of `kind` taken at `created_at`.
    pub fn advance(
        existing: Option<&ChainMarker>,
        server: &str,
        database: &str,
        kind: BackupKind,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ChainMarker, ChainIntegrityError> {
        match (existing, kind) {
            (None, BackupKind::Incremental) => Err(ChainIntegrityError::OrphanIncremental {
                server: server.to_string(),
                database: database.to_string(),
                created_at,
            }),
            (None, BackupKind::Full) => Ok(ChainMarker {
                server: server.to_string(),
                database: database.to_string(),
                last_full: created_at,
                last_any: created_at,
                updated_at: now,
            }),
            (Some(prev), BackupKind::Full) => Ok(ChainMarker {
                last_full: created_at.max(prev.last_full),
                last_any: created_at.max(prev.last_any),
                updated_at: now,
                ..prev.clone()
            }),
            (Some(prev), BackupKind::Incremental) => Ok(ChainMarker {
                last_any: created_at.max(prev.last_any),
                updated_at: now,
                ..prev.clone()
            }),
        }
    }

    /// Marker implied by the surviving artifacts, `None` when no full
    /// backup survives. Incrementals without a preceding full are ignored.
    pub fn from_artifacts(
        server: &str,
        database: &str,
        artifacts: &[BackupArtifact],
        now: DateTime<Utc>,
    ) -> Option<ChainMarker> {
        let last_full = artifacts
            .iter()
            .filter(|a| a.is_full())
            .map(|a| a.created_at)
            .max()?;
        let first_full = artifacts
            .iter()
            .filter(|a| a.is_full())
            .map(|a| a.created_at)
            .min()?;
        let last_any = artifacts
            .iter()
            .map(|a| a.created_at)
            .filter(|ts| *ts >= first_full)
            .max()
            .unwrap_or(last_full);

        Some(ChainMarker {
            server: server.to_string(),
            database: database.to_string(),
            last_full,
            last_any,
            updated_at: now,
        })
    }

    /// Same chain position, ignoring `updated_at`.
    pub fn same_position(&self, other: &ChainMarker) -> bool {
        self.last_full == other.last_full && self.last_any == other.last_any
    }
}

fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp '{raw}'").into(),
        )
    })
}

fn row_to_marker(row: &Row) -> rusqlite::Result<ChainMarker> {
    Ok(ChainMarker {
        server: row.get(0)?,
        database: row.get(1)?,
        last_full: timestamp_column(row, 2)?,
        last_any: timestamp_column(row, 3)?,
        updated_at: timestamp_column(row, 4)?,
    })
}

const COLUMNS: &str = "server, database, last_full, last_any, updated_at";

pub fn find(conn: &Connection, server: &str, database: &str) -> rusqlite::Result<Option<ChainMarker>> {
    let sql = format!("SELECT {COLUMNS} FROM chain_markers WHERE server = ?1 AND database = ?2");
    conn.query_row(&sql, params![server, database], row_to_marker)
        .optional()
}

pub fn find_by_server(conn: &Connection, server: &str) -> rusqlite::Result<Vec<ChainMarker>> {
    let sql = format!("SELECT {COLUMNS} FROM chain_markers WHERE server = ?1 ORDER BY database");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![server], row_to_marker)?;
    rows.collect()
}

pub fn upsert(conn: &Connection, marker: &ChainMarker) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO chain_markers (server, database, last_full, last_any, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(server, database) DO UPDATE SET
           last_full = excluded.last_full,
           last_any = excluded.last_any,
           updated_at = excluded.updated_at",
        params![
            marker.server,
            marker.database,
            format_timestamp(marker.last_full),
            format_timestamp(marker.last_any),
            format_timestamp(marker.updated_at),
        ],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, server: &str, database: &str) -> rusqlite::Result<bool> {
    let changes = conn.execute(
        "DELETE FROM chain_markers WHERE server = ?1 AND database = ?2",
        params![server, database],
    )?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn artifact(kind: BackupKind, d: u32) -> BackupArtifact {
        BackupArtifact {
            server: "db1".into(),
            database: "app".into(),
            kind,
            created_at: day(d),
            path: PathBuf::new(),
            size_bytes: 0,
        }
    }

    #[test]
    fn test_advance_requires_full_first() {
        let err = ChainMarker::advance(None, "db1", "app", BackupKind::Incremental, day(2), day(2));
        assert!(matches!(err, Err(ChainIntegrityError::OrphanIncremental { .. })));

        let marker = ChainMarker::advance(None, "db1", "app", BackupKind::Full, day(1), day(1)).unwrap();
        assert_eq!(marker.last_full, day(1));
        assert_eq!(marker.last_any, day(1));
    }

    #[test]
    fn test_advance_incremental_moves_last_any_only() {
        let full = ChainMarker::advance(None, "db1", "app", BackupKind::Full, day(1), day(1)).unwrap();
        let incr = ChainMarker::advance(Some(&full), "db1", "app", BackupKind::Incremental, day(3), day(3)).unwrap();
        assert_eq!(incr.last_full, day(1));
        assert_eq!(incr.last_any, day(3));

        let next = ChainMarker::advance(Some(&incr), "db1", "app", BackupKind::Full, day(5), day(5)).unwrap();
        assert_eq!(next.last_full, day(5));
        assert_eq!(next.last_any, day(5));
    }

    #[test]
    fn test_from_artifacts() {
        let artifacts = vec![
            artifact(BackupKind::Incremental, 1),
            artifact(BackupKind::Full, 2),
            artifact(BackupKind::Incremental, 4),
            artifact(BackupKind::Full, 6),
            artifact(BackupKind::Incremental, 7),
        ];
        let marker = ChainMarker::from_artifacts("db1", "app", &artifacts, day(8)).unwrap();
        assert_eq!(marker.last_full, day(6));
        assert_eq!(marker.last_any, day(7));

        let orphans_only = vec![artifact(BackupKind::Incremental, 1)];
        assert!(ChainMarker::from_artifacts("db1", "app", &orphans_only, day(8)).is_none());
    }
}
