//! Backup runs: per server, resolve the selection, then per database
//! decide, dump, record and prune.

use crate::models::{Access, BackupArtifact, BackupKind, ChainMarker, Server};
use crate::ports::{Connector, DatabaseBackupPort, DumpOptions};
use crate::services::artifact_store::ArtifactStore;
use crate::services::backup_scheduler::{BackupTypeScheduler, DecisionReason, TypeRequest};
use crate::services::chain_state::{self, ChainStateStore};
use crate::services::connection_resolver::ConnectionResolver;
use crate::services::restore_planner::{RestorePlan, RestorePlanner, RestoreTarget};
use crate::services::retention::RetentionManager;
use crate::services::run_lock::RunLock;
use crate::utils::clock::Clock;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseOutcome {
    pub database: String,
    pub status: OutcomeStatus,
    pub kind: Option<BackupKind>,
    pub reason: Option<DecisionReason>,
    pub created_at: Option<DateTime<Utc>>,
    pub path: Option<PathBuf>,
    pub size_bytes: u64,
    pub pruned: usize,
    pub error: Option<String>,
}

impl DatabaseOutcome {
    fn failed(database: &str, error: String) -> Self {
        Self {
            database: database.to_string(),
            status: OutcomeStatus::Failed,
            kind: None,
            reason: None,
            created_at: None,
            path: None,
            size_bytes: 0,
            pruned: 0,
            error: Some(error),
        }
    }

    fn succeeded(artifact: &BackupArtifact, reason: DecisionReason) -> Self {
        Self {
            database: artifact.database.clone(),
            status: OutcomeStatus::Succeeded,
            kind: Some(artifact.kind),
            reason: Some(reason),
            created_at: Some(artifact.created_at),
            path: Some(artifact.path.clone()),
            size_bytes: artifact.size_bytes,
            pruned: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerReport {
    pub server: String,
    pub access: Option<Access>,
    /// Failure that stopped the whole server
    pub error: Option<String>,
    pub databases: Vec<DatabaseOutcome>,
}

impl ServerReport {
    pub fn failures(&self) -> usize {
        let server_failure = usize::from(self.error.is_some());
        server_failure
            + self
                .databases
                .iter()
                .filter(|d| d.status == OutcomeStatus::Failed)
                .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub servers: Vec<ServerReport>,
}

impl RunSummary {
    pub fn failures(&self) -> usize {
        self.servers.iter().map(ServerReport::failures).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failures() == 0
    }
}

pub struct Orchestrator<'a> {
    connector: &'a dyn Connector,
    chain: &'a dyn ChainStateStore,
    artifacts: &'a dyn ArtifactStore,
    clock: &'a dyn Clock,
    probe_timeout: std::time::Duration,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        connector: &'a dyn Connector,
        chain: &'a dyn ChainStateStore,
        artifacts: &'a dyn ArtifactStore,
        clock: &'a dyn Clock,
        probe_timeout: std::time::Duration,
    ) -> Self {
        Self {
            connector,
            chain,
            artifacts,
            clock,
            probe_timeout,
        }
    }

    /// Back up every server in turn while holding the run lock.
    pub fn run_all(&self, lock: &RunLock, servers: &[Server], request: TypeRequest) -> Result<RunSummary> {
        let _guard = lock.acquire()?;

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", run_id = %run_id);
        let _enter = span.enter();

        let started_at = self.clock.now();
        tracing::info!(servers = servers.len(), request = ?request, "Backup run started");

        let reports: Vec<ServerReport> = servers.iter().map(|server| self.run(server, request)).collect();

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: self.clock.now(),
            servers: reports,
        };
        if summary.is_success() {
            tracing::info!("Backup run finished");
        } else {
            tracing::warn!(failures = summary.failures(), "Backup run finished with failures");
        }
        Ok(summary)
    }

    /// Back up one server. Failures are captured in the report.
    pub fn run(&self, server: &Server, request: TypeRequest) -> ServerReport {
        let mut report = ServerReport {
            server: server.name.clone(),
            access: None,
            error: None,
            databases: Vec::new(),
        };

        let resolver = ConnectionResolver::new(self.connector, self.probe_timeout);
        let (access, port) = match resolver.connect(server) {
            Ok(connected) => connected,
            Err(e) => {
                tracing::error!(server = %server.name, operation = "connect", error = %e, "Server skipped");
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.access = Some(access);

        let live = match port.enumerate_databases() {
            Ok(live) => live,
            Err(e) => {
                tracing::error!(server = %server.name, operation = "enumerate", error = %e, "Server skipped");
                report.error = Some(e.to_string());
                return report;
            }
        };
        let selection = match server.selection.resolve(&live) {
            Ok(selection) => selection,
            Err(e) => {
                tracing::error!(server = %server.name, operation = "select", error = %e, "Server skipped");
                report.error = Some(e.to_string());
                return report;
            }
        };

        tracing::info!(
            server = %server.name,
            access = %access,
            databases = selection.databases.len(),
            "Backing up server"
        );

        for name in &selection.missing {
            tracing::error!(server = %server.name, database = %name, operation = "select", "Database not found on server");
            report
                .databases
                .push(DatabaseOutcome::failed(name, "database not found".into()));
        }

        for database in &selection.databases {
            let outcome = match self.backup_database(server, port.as_ref(), database, request) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        server = %server.name,
                        database = %database,
                        operation = "backup",
                        error = %e,
                        "Backup failed"
                    );
                    DatabaseOutcome::failed(database, e.to_string())
                }
            };
            report.databases.push(outcome);
        }

        report
    }

    fn backup_database(
        &self,
        server: &Server,
        port: &dyn DatabaseBackupPort,
        database: &str,
        request: TypeRequest,
    ) -> Result<DatabaseOutcome> {
        let now = self.clock.now();
        let existing = self.artifacts.list(server, database)?;
        let marker = chain_state::reconcile(self.chain, &server.name, database, &existing, now)?;

        let decision = BackupTypeScheduler::new(self.chain).decide(server, database, request, now, || {
            port.log_capture_available()
        })?;
        let created_at = next_timestamp(now, marker.as_ref(), &existing);
        tracing::info!(
            server = %server.name,
            database,
            kind = %decision.kind,
            reason = %decision.reason,
            created_at = %created_at,
            "Starting backup"
        );

        let options = DumpOptions::for_kind(decision.kind);
        let artifact = self
            .artifacts
            .write(server, database, decision.kind, created_at, &mut |sink: &mut dyn Write| {
                port.dump(database, &options, sink)
            })
            .map_err(|e| match e {
                BackupError::Dump { .. } => e,
                other => BackupError::Dump {
                    server: server.name.clone(),
                    database: database.to_string(),
                    reason: other.to_string(),
                },
            })?;

        // The artifact is durable but the marker is not advanced yet. A crash
        // here is repaired by reconcile() on the next run.
        self.chain
            .record_success(&server.name, database, decision.kind, created_at, self.clock.now())?;

        tracing::info!(
            server = %server.name,
            database,
            kind = %artifact.kind,
            created_at = %artifact.created_at,
            size_bytes = artifact.size_bytes,
            "Backup completed"
        );

        let mut outcome = DatabaseOutcome::succeeded(&artifact, decision.reason);
        if server.retention.enabled {
            let retention = RetentionManager::new(self.artifacts, self.chain, self.clock);
            match retention.prune(server, database, &server.retention, false) {
                Ok(pruned) => {
                    outcome.pruned = pruned.deleted.len();
                    if !pruned.is_clean() {
                        outcome.status = OutcomeStatus::Failed;
                        outcome.error = Some(format!(
                            "prune left {} backup(s) undeleted",
                            pruned.failures.len()
                        ));
                    }
                }
                Err(e) => {
                    tracing::error!(server = %server.name, database, operation = "prune", error = %e, "Prune failed");
                    outcome.status = OutcomeStatus::Failed;
                    outcome.error = Some(format!("prune failed: {e}"));
                }
            }
        }

        Ok(outcome)
    }

    /// Plan and apply a restore of one database. The caller holds the run lock.
    pub fn restore(&self, server: &Server, database: &str, target: RestoreTarget) -> Result<RestorePlan> {
        let planner = RestorePlanner::new(self.artifacts);
        let plan = planner.plan(server, database, target)?;

        let resolver = ConnectionResolver::new(self.connector, self.probe_timeout);
        let (access, port) = resolver.connect(server)?;
        tracing::info!(server = %server.name, database, access = %access, steps = plan.step_count(), "Restoring");

        planner.execute(&plan, port.as_ref())?;
        Ok(plan)
    }
}

/// `now`, unless that would not sort after what already exists.
fn next_timestamp(
    now: DateTime<Utc>,
    marker: Option<&ChainMarker>,
    existing: &[BackupArtifact],
) -> DateTime<Utc> {
    let newest = existing
        .iter()
        .map(|a| a.created_at)
        .chain(marker.map(|m| m.last_any))
        .max();
    match newest {
        Some(newest) if now <= newest => {
            let bumped = newest + Duration::seconds(1);
            tracing::debug!(now = %now, created_at = %bumped, "Clock did not advance past last backup, bumping timestamp");
            bumped
        }
        _ => now,
    }
}
