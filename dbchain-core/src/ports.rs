//! Seams to the outside world: the database tooling and the way commands
//! reach a server. Concrete adapters live in the binary crate.

use crate::models::{Access, BackupKind, Server};
use crate::utils::errors::Result;
use std::io::{Read, Write};
use std::time::Duration;

/// Options passed to a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpOptions {
    pub kind: BackupKind,
    /// Consistent snapshot without locking tables
    pub single_transaction: bool,
    /// Record the binary log position in the dump header
    pub record_log_position: bool,
    pub routines: bool,
    pub triggers: bool,
    pub events: bool,
}

impl DumpOptions {
    pub fn for_kind(kind: BackupKind) -> Self {
        Self {
            kind,
            single_transaction: true,
            record_log_position: kind == BackupKind::Incremental,
            routines: true,
            triggers: true,
            events: true,
        }
    }
}

/// Produces and applies compressed logical dumps for one server.
pub trait DatabaseBackupPort {
    /// Databases on the server, in server order.
    fn enumerate_databases(&self) -> Result<Vec<String>>;

    /// Whether the server keeps a binary log an incremental can anchor to.
    fn log_capture_available(&self) -> Result<bool>;

    /// Stream a compressed dump of `database` into `sink`. Returns bytes written.
    fn dump(&self, database: &str, options: &DumpOptions, sink: &mut dyn Write) -> Result<u64>;

    /// Replay a compressed dump read from `source` into `database`.
    fn apply(&self, database: &str, source: &mut dyn Read) -> Result<()>;
}

/// Shell-like channel on which database tooling runs.
pub trait ExecutionContext {
    /// Run `command`, streaming stdout into `stdout`. Returns bytes copied.
    fn exec_streaming(&self, command: &str, stdout: &mut dyn Write) -> Result<u64>;

    /// Run `command`, feeding `stdin` to it.
    fn exec_with_input(&self, command: &str, stdin: &mut dyn Read) -> Result<()>;

    /// Run `command` and capture stdout as text.
    fn exec_capture(&self, command: &str) -> Result<String> {
        let mut out = Vec::new();
        self.exec_streaming(command, &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// Opens an authenticated indirect connection to a server.
pub trait TunnelPort {
    fn open(&self, server: &Server) -> Result<Box<dyn ExecutionContext>>;
}

/// Builds a [`DatabaseBackupPort`] for a server over the chosen access path.
pub trait Connector {
    /// Bounded direct reachability check. Failure is a signal, not an error.
    fn probe(&self, server: &Server, timeout: Duration) -> bool;

    fn connect(&self, server: &Server, access: Access) -> Result<Box<dyn DatabaseBackupPort>>;
}
