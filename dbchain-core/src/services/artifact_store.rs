//! Artifact index and storage.

use crate::models::artifact::{artifact_file_name, parse_file_name, PARTIAL_SUFFIX};
use crate::models::{BackupArtifact, BackupKind, Server};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Callback that streams an artifact's content into the given sink.
pub type FillFn<'a> = dyn FnMut(&mut dyn Write) -> Result<u64> + 'a;

pub trait ArtifactStore {
    /// Finished artifacts of one database, in file name (chronological) order.
    fn list(&self, server: &Server, database: &str) -> Result<Vec<BackupArtifact>>;

    /// Databases with an artifact directory under the server's backup root.
    fn databases(&self, server: &Server) -> Result<Vec<String>>;

    /// Create an artifact atomically: it only becomes visible to `list`
    /// once `fill` succeeded and the content is durable.
    fn write(
        &self,
        server: &Server,
        database: &str,
        kind: BackupKind,
        created_at: DateTime<Utc>,
        fill: &mut FillFn<'_>,
    ) -> Result<BackupArtifact>;

    fn open(&self, artifact: &BackupArtifact) -> Result<Box<dyn Read>>;

    fn delete(&self, artifact: &BackupArtifact) -> Result<()>;
}

/// Artifacts as files under each server's backup root.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsArtifactStore;

fn database_dir(server: &Server, database: &str) -> Result<PathBuf> {
    let unsafe_name = database.is_empty()
        || database == "."
        || database == ".."
        || database.contains(|c: char| matches!(c, '/' | '\\' | '\0'));
    if unsafe_name {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("database name '{database}' cannot be used as a directory name"),
        )
        .into());
    }
    Ok(server.backup_root.join(database))
}

fn write_partial(path: &Path, fill: &mut FillFn<'_>) -> Result<u64> {
    let mut writer = BufWriter::new(File::create(path)?);
    let bytes = fill(&mut writer)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(bytes)
}

impl ArtifactStore for FsArtifactStore {
    fn list(&self, server: &Server, database: &str) -> Result<Vec<BackupArtifact>> {
        let dir = database_dir(server, database)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut artifacts = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let Some((created_at, kind)) = parse_file_name(&name) else {
                if !name.ends_with(PARTIAL_SUFFIX) {
                    tracing::debug!(path = %entry.path().display(), "Ignoring unrecognised file in backup directory");
                }
                continue;
            };
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            artifacts.push(BackupArtifact {
                server: server.name.clone(),
                database: database.to_string(),
                kind,
                created_at,
                path: entry.path().to_path_buf(),
                size_bytes,
            });
        }

        Ok(artifacts)
    }

    fn databases(&self, server: &Server) -> Result<Vec<String>> {
        if !server.backup_root.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in WalkDir::new(&server.backup_root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    fn write(
        &self,
        server: &Server,
        database: &str,
        kind: BackupKind,
        created_at: DateTime<Utc>,
        fill: &mut FillFn<'_>,
    ) -> Result<BackupArtifact> {
        let dir = database_dir(server, database)?;
        fs::create_dir_all(&dir)?;

        let final_path = dir.join(artifact_file_name(created_at, kind));
        if final_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("artifact {} already exists", final_path.display()),
            )
            .into());
        }
        let partial_path = dir.join(format!(
            "{}{}",
            artifact_file_name(created_at, kind),
            PARTIAL_SUFFIX
        ));

        let size_bytes = match write_partial(&partial_path, fill) {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&partial_path) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(path = %partial_path.display(), error = %cleanup, "Failed to remove partial artifact");
                    }
                }
                return Err(e);
            }
        };

        fs::rename(&partial_path, &final_path)?;

        Ok(BackupArtifact {
            server: server.name.clone(),
            database: database.to_string(),
            kind,
            created_at,
            path: final_path,
            size_bytes,
        })
    }

    fn open(&self, artifact: &BackupArtifact) -> Result<Box<dyn Read>> {
        Ok(Box::new(File::open(&artifact.path)?))
    }

    fn delete(&self, artifact: &BackupArtifact) -> Result<()> {
        match fs::remove_file(&artifact.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %artifact.path.display(), "Artifact already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
