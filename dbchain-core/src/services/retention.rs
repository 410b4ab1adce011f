//! Age- and count-based pruning of backup chains.

use crate::models::artifact::sort_chronologically;
use crate::models::{BackupArtifact, BackupKind, ChainMarker, RetentionPolicy, Server};
use crate::services::artifact_store::ArtifactStore;
use crate::services::chain_state::{self, ChainStateStore};
use crate::utils::clock::Clock;
use crate::utils::errors::{ChainIntegrityError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;

/// A full backup slated for deletion and the incrementals that depend on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneGroup {
    pub full: BackupArtifact,
    pub incrementals: Vec<BackupArtifact>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunePlan {
    pub groups: Vec<PruneGroup>,
    /// Incrementals that already lack a full predecessor
    pub orphans: Vec<BackupArtifact>,
    pub retained_full: usize,
}

impl PrunePlan {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.orphans.is_empty()
    }
}

/// Decide what a prune would delete.
///
/// The newest `min_full_backups_kept` fulls always stay. Any older full is
/// removed once it is past the cutoff and the next newer full is at or
/// before the cutoff too; otherwise it is the baseline for restores inside
/// the retention window.
pub fn evaluate(
    server: &str,
    database: &str,
    artifacts: &[BackupArtifact],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> std::result::Result<PrunePlan, ChainIntegrityError> {
    let mut sorted = artifacts.to_vec();
    sort_chronologically(server, database, &mut sorted)?;

    let fulls: Vec<&BackupArtifact> = sorted.iter().filter(|a| a.is_full()).collect();
    let cutoff = now
        .checked_sub_signed(policy.max_age())
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let keep = policy.min_full_backups_kept as usize;

    // Newest first.
    let mut doomed = Vec::new();
    for (idx, full) in fulls.iter().enumerate().rev() {
        if idx + keep >= fulls.len() {
            continue;
        }
        let newer = fulls[idx + 1];
        if full.created_at < cutoff && newer.created_at <= cutoff {
            doomed.push(idx);
        }
    }

    let groups = doomed
        .iter()
        .rev()
        .map(|&idx| {
            let full = fulls[idx];
            let next = fulls.get(idx + 1).map(|a| a.created_at);
            let incrementals = sorted
                .iter()
                .filter(|a| a.kind == BackupKind::Incremental)
                .filter(|a| a.created_at > full.created_at)
                .filter(|a| next.map_or(true, |next| a.created_at < next))
                .cloned()
                .collect();
            PruneGroup {
                full: full.clone(),
                incrementals,
            }
        })
        .collect();

    Ok(PrunePlan {
        groups,
        orphans: orphans(&sorted),
        retained_full: fulls.len() - doomed.len(),
    })
}

/// Incrementals older than every full in `sorted`.
fn orphans(sorted: &[BackupArtifact]) -> Vec<BackupArtifact> {
    let oldest_full = sorted.iter().find(|a| a.is_full()).map(|a| a.created_at);
    sorted
        .iter()
        .filter(|a| a.kind == BackupKind::Incremental)
        .filter(|a| oldest_full.map_or(true, |full| a.created_at < full))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneFailure {
    pub path: PathBuf,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub server: String,
    pub database: String,
    pub dry_run: bool,
    pub skipped: bool,
    pub deleted: Vec<BackupArtifact>,
    pub failures: Vec<PruneFailure>,
    pub retained_full: usize,
    pub marker: Option<ChainMarker>,
}

impl PruneReport {
    fn empty(server: &str, database: &str, dry_run: bool) -> Self {
        Self {
            server: server.to_string(),
            database: database.to_string(),
            dry_run,
            skipped: false,
            deleted: Vec::new(),
            failures: Vec::new(),
            retained_full: 0,
            marker: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct RetentionManager<'a> {
    artifacts: &'a dyn ArtifactStore,
    chain: &'a dyn ChainStateStore,
    clock: &'a dyn Clock,
}

impl<'a> RetentionManager<'a> {
    pub fn new(artifacts: &'a dyn ArtifactStore, chain: &'a dyn ChainStateStore, clock: &'a dyn Clock) -> Self {
        Self {
            artifacts,
            chain,
            clock,
        }
    }

    pub fn prune(
        &self,
        server: &Server,
        database: &str,
        policy: &RetentionPolicy,
        dry_run: bool,
    ) -> Result<PruneReport> {
        let mut report = PruneReport::empty(&server.name, database, dry_run);
        if !policy.enabled {
            tracing::debug!(server = %server.name, database, "Retention disabled, skipping prune");
            report.skipped = true;
            return Ok(report);
        }

        let now = self.clock.now();
        let listed = self.artifacts.list(server, database)?;
        let plan = evaluate(&server.name, database, &listed, policy, now)?;
        report.retained_full = plan.retained_full;

        if dry_run {
            for group in &plan.groups {
                report.deleted.push(group.full.clone());
                report.deleted.extend(group.incrementals.iter().cloned());
            }
            report.deleted.extend(plan.orphans.iter().cloned());
            report.deleted.sort_by_key(|a| a.created_at);
            tracing::info!(
                server = %server.name,
                database,
                would_delete = report.deleted.len(),
                "Dry run, nothing deleted"
            );
            return Ok(report);
        }

        let mut failed = HashSet::new();
        for group in &plan.groups {
            if !self.delete_one(&group.full, &mut report, &mut failed) {
                tracing::warn!(
                    server = %server.name,
                    database,
                    created_at = %group.full.created_at,
                    "Full backup not deleted, keeping its incrementals"
                );
                continue;
            }
            for incr in &group.incrementals {
                self.delete_one(incr, &mut report, &mut failed);
            }
        }

        // Second pass over what is actually left.
        let mut remaining = self.artifacts.list(server, database)?;
        sort_chronologically(&server.name, database, &mut remaining)?;
        for orphan in orphans(&remaining) {
            if failed.contains(&orphan.created_at) {
                continue;
            }
            tracing::info!(
                server = %server.name,
                database,
                created_at = %orphan.created_at,
                "Removing orphaned incremental"
            );
            self.delete_one(&orphan, &mut report, &mut failed);
        }

        let survivors = self.artifacts.list(server, database)?;
        report.marker = chain_state::reconcile(self.chain, &server.name, database, &survivors, now)?;
        report.retained_full = survivors.iter().filter(|a| a.is_full()).count();

        tracing::info!(
            server = %server.name,
            database,
            deleted = report.deleted.len(),
            failed = report.failures.len(),
            retained_full = report.retained_full,
            "Prune finished"
        );
        Ok(report)
    }

    fn delete_one(
        &self,
        artifact: &BackupArtifact,
        report: &mut PruneReport,
        failed: &mut HashSet<DateTime<Utc>>,
    ) -> bool {
        match self.artifacts.delete(artifact) {
            Ok(()) => {
                tracing::info!(
                    server = %artifact.server,
                    database = %artifact.database,
                    kind = %artifact.kind,
                    created_at = %artifact.created_at,
                    path = %artifact.path.display(),
                    "Deleted backup"
                );
                report.deleted.push(artifact.clone());
                true
            }
            Err(e) => {
                tracing::error!(
                    server = %artifact.server,
                    database = %artifact.database,
                    kind = %artifact.kind,
                    created_at = %artifact.created_at,
                    path = %artifact.path.display(),
                    error = %e,
                    "Failed to delete backup"
                );
                failed.insert(artifact.created_at);
                report.failures.push(PruneFailure {
                    path: artifact.path.clone(),
                    kind: artifact.kind,
                    created_at: artifact.created_at,
                    error: e.to_string(),
                });
                false
            }
        }
    }
}
