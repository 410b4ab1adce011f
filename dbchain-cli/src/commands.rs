//! Subcommand handlers. Each runs on a blocking thread and reports how the
//! process should exit.

use crate::services::connector::MysqlConnector;
use crate::services::ssh_tunnel::SshTunnel;
use dbchain_core::models::{BackupKind, ChainMarker, Server};
use dbchain_core::services::artifact_store::{ArtifactStore, FsArtifactStore};
use dbchain_core::services::backup_scheduler::TypeRequest;
use dbchain_core::services::chain_state::{ChainStateStore, SqliteChainStore};
use dbchain_core::services::orchestrator::{OutcomeStatus, Orchestrator, RunSummary};
use dbchain_core::services::restore_planner::{RestorePlan, RestorePlanner, RestoreTarget};
use dbchain_core::services::retention::{PruneReport, RetentionManager};
use dbchain_core::services::run_lock::RunLock;
use dbchain_core::utils::SystemClock;
use dbchain_core::{BackupError, Config, Result};
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success,
    /// Finished, but some server or database failed
    Failures,
    HardAbort,
    Interrupted,
}

impl Exit {
    pub fn code(self) -> u8 {
        match self {
            Exit::Success => 0,
            Exit::Failures => 1,
            Exit::HardAbort => 2,
            Exit::Interrupted => 130,
        }
    }

    pub fn for_error(err: &BackupError) -> Self {
        if err.is_hard_abort() {
            Exit::HardAbort
        } else {
            Exit::Failures
        }
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    Run {
        server: Option<String>,
        request: TypeRequest,
    },
    Plan {
        server: String,
        database: String,
        target: RestoreTarget,
    },
    Prune {
        server: Option<String>,
        dry_run: bool,
    },
    Restore {
        server: String,
        database: String,
        target: RestoreTarget,
    },
    Status {
        server: Option<String>,
    },
}

pub fn execute(config: &Config, action: Action, json: bool) -> Result<Exit> {
    match action {
        Action::Run { server, request } => run(config, server.as_deref(), request, json),
        Action::Plan {
            server,
            database,
            target,
        } => plan(config, &server, &database, target, json),
        Action::Prune { server, dry_run } => prune(config, server.as_deref(), dry_run, json),
        Action::Restore {
            server,
            database,
            target,
        } => restore(config, &server, &database, target, json),
        Action::Status { server } => status(config, server.as_deref(), json),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

fn run(config: &Config, server: Option<&str>, request: TypeRequest, json: bool) -> Result<Exit> {
    let servers = config.select_servers(server)?;
    let chain = SqliteChainStore::open(&config.general.state_db)?;
    let connector = MysqlConnector::new(SshTunnel);
    let orchestrator = Orchestrator::new(
        &connector,
        &chain,
        &FsArtifactStore,
        &SystemClock,
        config.probe_timeout(),
    );

    let summary = orchestrator.run_all(&RunLock::new(&config.general.lock_file), &servers, request)?;
    if json {
        print_json(&summary)?;
    } else {
        print_run_summary(&summary);
    }

    Ok(if summary.is_success() {
        Exit::Success
    } else {
        Exit::Failures
    })
}

fn print_run_summary(summary: &RunSummary) {
    for report in &summary.servers {
        match (&report.error, report.access) {
            (Some(error), _) => println!("{}: FAILED ({error})", report.server),
            (None, Some(access)) => println!("{} ({access})", report.server),
            (None, None) => println!("{}", report.server),
        }
        for db in &report.databases {
            match db.status {
                OutcomeStatus::Succeeded => println!(
                    "  {:<24} {:<12} {:<22} {:>10}  {}",
                    db.database,
                    db.kind.map(|k| k.to_string()).unwrap_or_default(),
                    db.created_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    human_size(db.size_bytes),
                    db.reason.map(|r| r.to_string()).unwrap_or_default(),
                ),
                OutcomeStatus::Failed => println!(
                    "  {:<24} FAILED       {}",
                    db.database,
                    db.error.as_deref().unwrap_or("unknown error")
                ),
            }
        }
    }
    println!(
        "run {}: {} failure(s)",
        summary.run_id,
        summary.failures()
    );
}

fn print_plan(plan: &RestorePlan) {
    println!(
        "{}/{} restore to {} (reaches {})",
        plan.server,
        plan.database,
        plan.target,
        plan.restores_to().to_rfc3339()
    );
    for (step, artifact) in plan.steps().enumerate() {
        println!(
            "  {:>2}. {:<12} {}  {}",
            step + 1,
            artifact.kind.to_string(),
            artifact.created_at.to_rfc3339(),
            artifact.path.display()
        );
    }
}

fn plan(config: &Config, server: &str, database: &str, target: RestoreTarget, json: bool) -> Result<Exit> {
    let server = config.server(server)?;
    let plan = RestorePlanner::new(&FsArtifactStore).plan(server, database, target)?;
    if json {
        print_json(&plan)?;
    } else {
        print_plan(&plan);
    }
    Ok(Exit::Success)
}

fn restore(config: &Config, server: &str, database: &str, target: RestoreTarget, json: bool) -> Result<Exit> {
    let server = config.server(server)?;
    let chain = SqliteChainStore::open(&config.general.state_db)?;
    let connector = MysqlConnector::new(SshTunnel);
    let orchestrator = Orchestrator::new(
        &connector,
        &chain,
        &FsArtifactStore,
        &SystemClock,
        config.probe_timeout(),
    );

    let _guard = RunLock::new(&config.general.lock_file).acquire()?;
    let plan = orchestrator.restore(server, database, target)?;
    if json {
        print_json(&plan)?;
    } else {
        print_plan(&plan);
        println!("restored {} step(s)", plan.step_count());
    }
    Ok(Exit::Success)
}

#[derive(Debug, Serialize)]
struct PruneEntry {
    server: String,
    database: String,
    report: Option<PruneReport>,
    error: Option<String>,
}

fn prune(config: &Config, server: Option<&str>, dry_run: bool, json: bool) -> Result<Exit> {
    let servers = config.select_servers(server)?;
    let chain = SqliteChainStore::open(&config.general.state_db)?;
    let artifacts = FsArtifactStore;
    let manager = RetentionManager::new(&artifacts, &chain, &SystemClock);

    let _guard = RunLock::new(&config.general.lock_file).acquire()?;
    let mut entries = Vec::new();
    for server in &servers {
        for database in artifacts.databases(server)? {
            let entry = match manager.prune(server, &database, &server.retention, dry_run) {
                Ok(report) => PruneEntry {
                    server: server.name.clone(),
                    database,
                    error: (!report.is_clean()).then(|| format!("{} deletion(s) failed", report.failures.len())),
                    report: Some(report),
                },
                Err(e) => {
                    tracing::error!(server = %server.name, database = %database, operation = "prune", error = %e, "Prune failed");
                    PruneEntry {
                        server: server.name.clone(),
                        database,
                        report: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            entries.push(entry);
        }
    }

    if json {
        print_json(&entries)?;
    } else {
        for entry in &entries {
            match (&entry.report, &entry.error) {
                (Some(report), None) if report.skipped => {
                    println!("{}/{}: retention disabled", entry.server, entry.database)
                }
                (Some(report), None) => println!(
                    "{}/{}: {} {} backup(s), {} full backup(s) retained",
                    entry.server,
                    entry.database,
                    if dry_run { "would delete" } else { "deleted" },
                    report.deleted.len(),
                    report.retained_full
                ),
                (_, Some(error)) => println!("{}/{}: FAILED ({error})", entry.server, entry.database),
                (None, None) => {}
            }
        }
    }

    let failed = entries.iter().any(|e| e.error.is_some());
    Ok(if failed { Exit::Failures } else { Exit::Success })
}

#[derive(Debug, Serialize)]
struct DatabaseStatus {
    server: String,
    database: String,
    full_backups: usize,
    incremental_backups: usize,
    marker: Option<ChainMarker>,
}

fn database_status(
    server: &Server,
    artifacts: &dyn ArtifactStore,
    chain: &dyn ChainStateStore,
) -> Result<Vec<DatabaseStatus>> {
    let markers = chain.list(&server.name)?;
    let mut names: BTreeSet<String> = artifacts.databases(server)?.into_iter().collect();
    names.extend(markers.iter().map(|m| m.database.clone()));

    let mut rows = Vec::new();
    for database in names {
        let listed = artifacts.list(server, &database)?;
        rows.push(DatabaseStatus {
            server: server.name.clone(),
            full_backups: listed.iter().filter(|a| a.kind == BackupKind::Full).count(),
            incremental_backups: listed.iter().filter(|a| a.kind == BackupKind::Incremental).count(),
            marker: markers.iter().find(|m| m.database == database).cloned(),
            database,
        });
    }
    Ok(rows)
}

fn status(config: &Config, server: Option<&str>, json: bool) -> Result<Exit> {
    let servers = config.select_servers(server)?;
    let chain = SqliteChainStore::open(&config.general.state_db)?;

    let mut rows = Vec::new();
    for server in &servers {
        rows.extend(database_status(server, &FsArtifactStore, &chain)?);
    }

    if json {
        print_json(&rows)?;
    } else {
        println!(
            "{:<16} {:<24} {:>5} {:>5}  {:<25} {:<25}",
            "SERVER", "DATABASE", "FULL", "INCR", "LAST FULL", "LAST ANY"
        );
        for row in &rows {
            let (last_full, last_any) = row
                .marker
                .as_ref()
                .map(|m| (m.last_full.to_rfc3339(), m.last_any.to_rfc3339()))
                .unwrap_or_else(|| ("-".into(), "-".into()));
            println!(
                "{:<16} {:<24} {:>5} {:>5}  {:<25} {:<25}",
                row.server, row.database, row.full_backups, row.incremental_backups, last_full, last_any
            );
        }
    }
    Ok(Exit::Success)
}
