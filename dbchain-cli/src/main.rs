//! dbchain - full/incremental database backups, restores and retention.

mod commands;
mod services;
mod shutdown;

use crate::commands::{Action, Exit};
use anyhow::Context;
use clap::{Parser, Subcommand};
use dbchain_core::config::DEFAULT_CONFIG_PATH;
use dbchain_core::services::backup_scheduler::TypeRequest;
use dbchain_core::services::restore_planner::RestoreTarget;
use dbchain_core::utils::logger;
use dbchain_core::Config;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "DBCHAIN_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print machine-readable JSON summaries
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up every selected database
    Run {
        #[arg(long)]
        server: Option<String>,

        /// auto, full or incremental
        #[arg(long = "type", default_value = "auto")]
        backup_type: TypeRequest,
    },
    /// Show the restore plan for a point in time
    Plan {
        #[arg(long)]
        server: String,

        #[arg(long)]
        database: String,

        /// latest, YYYY-MM-DD, "YYYY-MM-DD HH:MM:SS" (UTC) or RFC 3339
        #[arg(long, default_value = "latest")]
        target: RestoreTarget,
    },
    /// Apply the retention policy
    Prune {
        #[arg(long)]
        server: Option<String>,

        #[arg(long)]
        dry_run: bool,
    },
    /// Restore a database to a point in time
    Restore {
        #[arg(long)]
        server: String,

        #[arg(long)]
        database: String,

        #[arg(long, default_value = "latest")]
        target: RestoreTarget,
    },
    /// Chain markers and backup counts per database
    Status {
        #[arg(long)]
        server: Option<String>,
    },
}

impl From<Command> for Action {
    fn from(command: Command) -> Self {
        match command {
            Command::Run { server, backup_type } => Action::Run {
                server,
                request: backup_type,
            },
            Command::Plan {
                server,
                database,
                target,
            } => Action::Plan {
                server,
                database,
                target,
            },
            Command::Prune { server, dry_run } => Action::Prune { server, dry_run },
            Command::Restore {
                server,
                database,
                target,
            } => Action::Restore {
                server,
                database,
                target,
            },
            Command::Status { server } => Action::Status { server },
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Load configuration; nothing runs against a config that does not validate
    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dbchain: {e:#}");
            return ExitCode::from(Exit::HardAbort.code());
        }
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = logger::init(log_level) {
        eprintln!("dbchain: failed to initialise logging: {e}");
    }

    tracing::debug!(
        "Starting dbchain v{} (config: {})",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    let action = Action::from(args.command);
    let json = args.json;
    let work = tokio::task::spawn_blocking(move || commands::execute(&config, action, json));

    let exit = tokio::select! {
        joined = work => match joined {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Command failed");
                eprintln!("dbchain: {e}");
                Exit::for_error(&e)
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker thread panicked");
                Exit::HardAbort
            }
        },
        signal = shutdown::wait_for_signal() => {
            tracing::warn!(signal, "Interrupted, exiting without waiting for the running operation");
            // The runtime would otherwise wait for the blocking worker on drop.
            std::process::exit(i32::from(Exit::Interrupted.code()));
        }
    };

    ExitCode::from(exit.code())
}
