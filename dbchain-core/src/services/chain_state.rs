//! Persistence of per-database chain markers.

use crate::db::{self, DbPool};
use crate::models::chain_marker::{self, ChainMarker};
use crate::models::{BackupArtifact, BackupKind};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;
use std::path::Path;

pub trait ChainStateStore {
    fn get(&self, server: &str, database: &str) -> Result<Option<ChainMarker>>;

    fn list(&self, server: &str) -> Result<Vec<ChainMarker>>;

    /// Advance the marker after a successful backup (read-modify-write).
    fn record_success(
        &self,
        server: &str,
        database: &str,
        kind: BackupKind,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ChainMarker>;

    fn put(&self, marker: &ChainMarker) -> Result<()>;

    fn delete(&self, server: &str, database: &str) -> Result<bool>;
}

/// Bring the stored marker in line with the artifacts that exist.
///
/// Returns the marker now stored, or `None` after removing a marker whose
/// chain has no surviving full backup.
pub fn reconcile(
    store: &dyn ChainStateStore,
    server: &str,
    database: &str,
    artifacts: &[BackupArtifact],
    now: DateTime<Utc>,
) -> Result<Option<ChainMarker>> {
    let current = store.get(server, database)?;
    let expected = ChainMarker::from_artifacts(server, database, artifacts, now);

    match (current, expected) {
        (None, None) => Ok(None),
        (Some(_), None) => {
            store.delete(server, database)?;
            tracing::warn!(server, database, "No full backup survives, chain marker removed");
            Ok(None)
        }
        (Some(cur), Some(exp)) if cur.same_position(&exp) => Ok(Some(cur)),
        (cur, Some(exp)) => {
            tracing::warn!(
                server,
                database,
                stored_last_full = ?cur.as_ref().map(|m| m.last_full),
                stored_last_any = ?cur.as_ref().map(|m| m.last_any),
                last_full = %exp.last_full,
                last_any = %exp.last_any,
                "Chain marker disagrees with artifacts, reconciled"
            );
            store.put(&exp)?;
            Ok(Some(exp))
        }
    }
}

/// SQLite-backed marker store.
#[derive(Clone)]
pub struct SqliteChainStore {
    pool: DbPool,
}

impl SqliteChainStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let pool = db::create_pool(db_path)?;
        db::migrate(&pool)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl ChainStateStore for SqliteChainStore {
    fn get(&self, server: &str, database: &str) -> Result<Option<ChainMarker>> {
        let conn = self.pool.get()?;
        Ok(chain_marker::find(&conn, server, database)?)
    }

    fn list(&self, server: &str) -> Result<Vec<ChainMarker>> {
        let conn = self.pool.get()?;
        Ok(chain_marker::find_by_server(&conn, server)?)
    }

    fn record_success(
        &self,
        server: &str,
        database: &str,
        kind: BackupKind,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ChainMarker> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = chain_marker::find(&tx, server, database)?;
        let marker = ChainMarker::advance(existing.as_ref(), server, database, kind, created_at, now)?;
        chain_marker::upsert(&tx, &marker)?;
        tx.commit()?;
        Ok(marker)
    }

    fn put(&self, marker: &ChainMarker) -> Result<()> {
        let conn = self.pool.get()?;
        chain_marker::upsert(&conn, marker)?;
        Ok(())
    }

    fn delete(&self, server: &str, database: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        Ok(chain_marker::delete(&conn, server, database)?)
    }
}
