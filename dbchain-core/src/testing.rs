//! In-memory fakes of the stores and ports, shared by the unit tests.

use crate::models::{Access, BackupArtifact, BackupKind, ChainMarker, Server};
use crate::ports::{Connector, DatabaseBackupPort, DumpOptions};
use crate::services::artifact_store::{ArtifactStore, FillFn};
use crate::services::chain_state::ChainStateStore;
use crate::utils::clock::Clock;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::{self, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Midnight UTC on 2024-01-`n`.
pub fn day(n: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, n, 0, 0, 0).unwrap()
}

/// Artifact of `db1`/`app`.
pub fn artifact(kind: BackupKind, created_at: DateTime<Utc>) -> BackupArtifact {
    let name = crate::models::artifact::artifact_file_name(created_at, kind);
    BackupArtifact {
        server: "db1".into(),
        database: "app".into(),
        kind,
        created_at,
        path: PathBuf::from("/backups/db1/app").join(name),
        size_bytes: 0,
    }
}

pub struct FixedClock(pub Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

#[derive(Default)]
pub struct MemoryChainStore {
    markers: Mutex<BTreeMap<(String, String), ChainMarker>>,
}

impl ChainStateStore for MemoryChainStore {
    fn get(&self, server: &str, database: &str) -> Result<Option<ChainMarker>> {
        let markers = self.markers.lock().unwrap();
        Ok(markers.get(&(server.to_string(), database.to_string())).cloned())
    }

    fn list(&self, server: &str) -> Result<Vec<ChainMarker>> {
        let markers = self.markers.lock().unwrap();
        Ok(markers.values().filter(|m| m.server == server).cloned().collect())
    }

    fn record_success(
        &self,
        server: &str,
        database: &str,
        kind: BackupKind,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ChainMarker> {
        let mut markers = self.markers.lock().unwrap();
        let key = (server.to_string(), database.to_string());
        let marker = ChainMarker::advance(markers.get(&key), server, database, kind, created_at, now)?;
        markers.insert(key, marker.clone());
        Ok(marker)
    }

    fn put(&self, marker: &ChainMarker) -> Result<()> {
        let mut markers = self.markers.lock().unwrap();
        markers.insert((marker.server.clone(), marker.database.clone()), marker.clone());
        Ok(())
    }

    fn delete(&self, server: &str, database: &str) -> Result<bool> {
        let mut markers = self.markers.lock().unwrap();
        Ok(markers.remove(&(server.to_string(), database.to_string())).is_some())
    }
}

/// Artifacts keyed by path, with injectable delete failures.
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<BTreeMap<PathBuf, (BackupArtifact, Vec<u8>)>>,
    undeletable: Mutex<HashSet<DateTime<Utc>>>,
}

impl MemoryArtifactStore {
    pub fn insert(&self, artifact: BackupArtifact) {
        let content = artifact.file_name().into_bytes();
        self.artifacts
            .lock()
            .unwrap()
            .insert(artifact.path.clone(), (artifact, content));
    }

    pub fn content_of(&self, artifact: &BackupArtifact) -> Vec<u8> {
        self.artifacts
            .lock()
            .unwrap()
            .get(&artifact.path)
            .map(|(_, content)| content.clone())
            .unwrap_or_default()
    }

    pub fn fail_delete(&self, created_at: DateTime<Utc>) {
        self.undeletable.lock().unwrap().insert(created_at);
    }

    pub fn all(&self) -> Vec<BackupArtifact> {
        let mut all: Vec<_> = self
            .artifacts
            .lock()
            .unwrap()
            .values()
            .map(|(a, _)| a.clone())
            .collect();
        all.sort_by_key(|a| a.created_at);
        all
    }

    pub fn times(&self, kind: BackupKind) -> Vec<DateTime<Utc>> {
        self.all()
            .into_iter()
            .filter(|a| a.kind == kind)
            .map(|a| a.created_at)
            .collect()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn list(&self, server: &Server, database: &str) -> Result<Vec<BackupArtifact>> {
        let mut listed: Vec<_> = self
            .artifacts
            .lock()
            .unwrap()
            .values()
            .filter(|(a, _)| a.server == server.name && a.database == database)
            .map(|(a, _)| a.clone())
            .collect();
        listed.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(listed)
    }

    fn databases(&self, server: &Server) -> Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .artifacts
            .lock()
            .unwrap()
            .values()
            .filter(|(a, _)| a.server == server.name)
            .map(|(a, _)| a.database.clone())
            .collect();
        Ok(names.into_iter().collect())
    }

    fn write(
        &self,
        server: &Server,
        database: &str,
        kind: BackupKind,
        created_at: DateTime<Utc>,
        fill: &mut FillFn<'_>,
    ) -> Result<BackupArtifact> {
        let mut content = Vec::new();
        let size_bytes = fill(&mut content)?;
        let name = crate::models::artifact::artifact_file_name(created_at, kind);
        let artifact = BackupArtifact {
            server: server.name.clone(),
            database: database.to_string(),
            kind,
            created_at,
            path: server.backup_root.join(database).join(name),
            size_bytes,
        };
        let mut artifacts = self.artifacts.lock().unwrap();
        if artifacts.contains_key(&artifact.path) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "artifact exists").into());
        }
        artifacts.insert(artifact.path.clone(), (artifact.clone(), content));
        Ok(artifact)
    }

    fn open(&self, artifact: &BackupArtifact) -> Result<Box<dyn Read>> {
        let artifacts = self.artifacts.lock().unwrap();
        match artifacts.get(&artifact.path) {
            Some((_, content)) => Ok(Box::new(Cursor::new(content.clone()))),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such artifact").into()),
        }
    }

    fn delete(&self, artifact: &BackupArtifact) -> Result<()> {
        if self.undeletable.lock().unwrap().contains(&artifact.created_at) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only").into());
        }
        self.artifacts.lock().unwrap().remove(&artifact.path);
        Ok(())
    }
}

#[derive(Default)]
struct PortState {
    databases: Vec<String>,
    binlog: bool,
    failing_dumps: HashSet<String>,
    apply_limit: Option<usize>,
    dumped: Vec<(String, BackupKind)>,
    applied: Vec<(String, Vec<u8>)>,
}

/// Scriptable database port. Clones share state so tests can inspect a
/// port after handing it to the code under test.
#[derive(Clone)]
pub struct FakePort {
    state: Arc<Mutex<PortState>>,
}

impl Default for FakePort {
    fn default() -> Self {
        let state = PortState {
            databases: vec!["app".into()],
            binlog: true,
            ..PortState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

impl FakePort {
    pub fn with_databases(self, names: &[&str]) -> Self {
        self.state.lock().unwrap().databases = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_binlog(self, enabled: bool) -> Self {
        self.state.lock().unwrap().binlog = enabled;
        self
    }

    pub fn failing_dump(self, database: &str) -> Self {
        self.state.lock().unwrap().failing_dumps.insert(database.to_string());
        self
    }

    /// Let `n` applies succeed, fail the next one.
    pub fn failing_apply_after(self, n: usize) -> Self {
        self.state.lock().unwrap().apply_limit = Some(n);
        self
    }

    pub fn dumped(&self) -> Vec<(String, BackupKind)> {
        self.state.lock().unwrap().dumped.clone()
    }

    pub fn applied(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().applied.clone()
    }
}

impl DatabaseBackupPort for FakePort {
    fn enumerate_databases(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().databases.clone())
    }

    fn log_capture_available(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().binlog)
    }

    fn dump(&self, database: &str, options: &DumpOptions, sink: &mut dyn Write) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if state.failing_dumps.contains(database) {
            sink.write_all(b"truncated")?;
            return Err(BackupError::Command(format!("dump of {database} failed")));
        }
        let body = format!("dump of {database} ({})", options.kind);
        sink.write_all(body.as_bytes())?;
        state.dumped.push((database.to_string(), options.kind));
        Ok(body.len() as u64)
    }

    fn apply(&self, database: &str, source: &mut dyn Read) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(limit) = state.apply_limit {
            if state.applied.len() >= limit {
                return Err(BackupError::Command(format!("apply to {database} failed")));
            }
        }
        let mut content = Vec::new();
        source.read_to_end(&mut content)?;
        state.applied.push((database.to_string(), content));
        Ok(())
    }
}

pub struct FakeConnector {
    probe_result: bool,
    failing: HashSet<Access>,
    port: FakePort,
    probes: Mutex<usize>,
    attempts: Mutex<Vec<Access>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            probe_result: true,
            failing: HashSet::new(),
            port: FakePort::default(),
            probes: Mutex::new(0),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_probe(mut self, reachable: bool) -> Self {
        self.probe_result = reachable;
        self
    }

    pub fn failing_access(mut self, access: Access) -> Self {
        self.failing.insert(access);
        self
    }

    pub fn with_port(mut self, port: FakePort) -> Self {
        self.port = port;
        self
    }

    pub fn probe_count(&self) -> usize {
        *self.probes.lock().unwrap()
    }

    pub fn connect_attempts(&self) -> Vec<Access> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Connector for FakeConnector {
    fn probe(&self, _server: &Server, _timeout: Duration) -> bool {
        *self.probes.lock().unwrap() += 1;
        self.probe_result
    }

    fn connect(&self, server: &Server, access: Access) -> Result<Box<dyn DatabaseBackupPort>> {
        self.attempts.lock().unwrap().push(access);
        if self.failing.contains(&access) {
            return Err(BackupError::Connectivity {
                server: server.name.clone(),
                reason: format!("{access} refused"),
            });
        }
        Ok(Box::new(self.port.clone()))
    }
}
