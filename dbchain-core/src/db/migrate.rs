use crate::db::connection::DbPool;
use crate::utils::errors::Result;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chain_markers (
  server TEXT NOT NULL,
  database TEXT NOT NULL,
  last_full TEXT NOT NULL,
  last_any TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (server, database),
  CHECK (last_any >= last_full)
);

CREATE INDEX IF NOT EXISTS idx_chain_markers_server ON chain_markers(server);
"#;

pub fn migrate(pool: &DbPool) -> Result<()> {
    tracing::debug!("[DB] Starting state store migration...");

    let conn = pool.get()?;
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(crate::BackupError::Store(format!(
            "state store schema version {version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    conn.execute_batch(SCHEMA)?;
    conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;

    tracing::debug!("[DB] Migration completed successfully");
    Ok(())
}
