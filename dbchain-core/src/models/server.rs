use crate::models::policy::{BackupSetSelection, RetentionPolicy, ScheduleConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How a server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Local,
    Remote,
    Auto,
}

fn default_connection_mode() -> ConnectionMode {
    ConnectionMode::Auto
}

/// Access method chosen for one run against a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Direct,
    Tunneled,
}

impl Access {
    pub fn other(self) -> Access {
        match self {
            Access::Direct => Access::Tunneled,
            Access::Tunneled => Access::Direct,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Direct => write!(f, "direct"),
            Access::Tunneled => write!(f, "tunneled"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseEndpoint {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    pub user: String,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_db_host() -> String {
    "127.0.0.1".into()
}

fn default_db_port() -> u16 {
    3306
}

impl fmt::Debug for DatabaseEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// SSH hop used for tunneled access.
#[derive(Clone, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_ssh_user")]
    pub user: String,

    #[serde(default)]
    pub key_path: Option<PathBuf>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".into()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl TunnelEndpoint {
    pub fn has_auth(&self) -> bool {
        self.key_path.is_some() || self.password.is_some()
    }
}

impl fmt::Debug for TunnelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("key_path", &self.key_path)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// One database server under backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    /// Unique key; also the artifact directory name under the backup root
    pub name: String,

    #[serde(default = "default_connection_mode")]
    pub connection: ConnectionMode,

    /// Legacy switch predating `connection = "remote"`
    #[serde(default)]
    pub force_tunnel: bool,

    pub database: DatabaseEndpoint,

    #[serde(default)]
    pub tunnel: Option<TunnelEndpoint>,

    /// Defaults to `<general.backup_root>/<name>` when loading config
    #[serde(default)]
    pub backup_root: PathBuf,

    #[serde(default)]
    pub selection: BackupSetSelection,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub retention: RetentionPolicy,
}

#[cfg(test)]
impl Server {
    pub(crate) fn for_tests(name: &str, backup_root: PathBuf) -> Self {
        Server {
            name: name.to_string(),
            connection: ConnectionMode::Local,
            force_tunnel: false,
            database: DatabaseEndpoint {
                host: default_db_host(),
                port: default_db_port(),
                user: "backup".into(),
                password: None,
            },
            tunnel: None,
            backup_root,
            selection: BackupSetSelection::default(),
            schedule: ScheduleConfig::default(),
            retention: RetentionPolicy::default(),
        }
    }
}
