//! Configuration management.
//!
//! Loads the TOML configuration, fills in per-server defaults and
//! validates everything before any backup logic runs.

use crate::models::{ConnectionMode, Server};
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dbchain/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Parent of every server's backup root
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    /// SQLite database holding chain markers
    #[serde(default = "default_state_db")]
    pub state_db: PathBuf,

    /// Advisory run lock
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Direct reachability probe timeout for `connection = "auto"`
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_backup_root() -> PathBuf {
    PathBuf::from("/var/backups/dbchain")
}

fn default_state_db() -> PathBuf {
    PathBuf::from("/var/lib/dbchain/state.db")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/run/dbchain.lock")
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            backup_root: default_backup_root(),
            state_db: default_state_db(),
            lock_file: default_lock_file(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        for server in &mut self.servers {
            if server.backup_root.as_os_str().is_empty() {
                server.backup_root = self.general.backup_root.join(&server.name);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.probe_timeout_secs == 0 {
            return Err(BackupError::Config("general.probe_timeout_secs must be at least 1".into()));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            let name = server.name.trim();
            if name.is_empty() {
                return Err(BackupError::Config("server name must not be empty".into()));
            }
            if name.contains(|c: char| matches!(c, '/' | '\\' | '\0')) || name == "." || name == ".." {
                return Err(BackupError::Config(format!(
                    "server name '{}' cannot be used as a directory name",
                    server.name
                )));
            }
            if !seen.insert(name) {
                return Err(BackupError::Config(format!("duplicate server name '{}'", server.name)));
            }
            validate_server(server)
                .map_err(|e| BackupError::Config(format!("server '{}': {}", server.name, config_reason(e))))?;
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.general.probe_timeout_secs)
    }

    /// Servers to operate on: the named one, or all of them.
    pub fn select_servers(&self, name: Option<&str>) -> Result<Vec<Server>> {
        match name {
            None => Ok(self.servers.clone()),
            Some(name) => self
                .server(name)
                .map(|server| vec![server.clone()]),
        }
    }

    pub fn server(&self, name: &str) -> Result<&Server> {
        self.servers
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| BackupError::Config(format!("unknown server '{name}'")))
    }
}

fn config_reason(err: BackupError) -> String {
    match err {
        BackupError::Config(reason) => reason,
        other => other.to_string(),
    }
}

fn validate_server(server: &Server) -> Result<()> {
    if server.database.user.trim().is_empty() {
        return Err(BackupError::Config("database.user must not be empty".into()));
    }
    server.selection.validate()?;
    server.retention.validate()?;

    let needs_tunnel = server.force_tunnel || server.connection != ConnectionMode::Local;
    match &server.tunnel {
        None if needs_tunnel => Err(BackupError::Config(
            "remote, auto and force_tunnel access need a [servers.tunnel] section".into(),
        )),
        Some(tunnel) if !tunnel.has_auth() => Err(BackupError::Config(
            "tunnel needs key_path or password".into(),
        )),
        Some(tunnel) if tunnel.host.trim().is_empty() => {
            Err(BackupError::Config("tunnel host must not be empty".into()))
        }
        _ => Ok(()),
    }
}
