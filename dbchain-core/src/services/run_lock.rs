//! Process-wide advisory lock serializing backup, restore and prune runs.
//!
//! The lock file holds a JSON record of the owner. A holder whose process
//! no longer exists on this host is treated as abandoned and reclaimed.
//! The record is hard-linked into place fully written, and a reclaim moves
//! the abandoned file aside instead of unlinking the path.

use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: i32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    record: LockRecord,
}

fn local_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn read_record(path: &Path) -> io::Result<Option<LockRecord>> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content).ok())
}

/// Whether the recorded owner may still be running.
fn owner_alive(record: &LockRecord, host: &str) -> bool {
    if record.host != host {
        // Cannot probe a process on another machine.
        return true;
    }
    if record.pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(record.pid), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unique file next to the lock, e.g. `dbchain.lock.tmp.<uuid>`.
    fn sibling(&self, tag: &str) -> PathBuf {
        let mut name = self.path.file_name().map(OsString::from).unwrap_or_default();
        name.push(format!(".{tag}.{}", Uuid::new_v4().simple()));
        self.path.with_file_name(name)
    }

    /// Write the record aside and hard-link it into place, so the lock path
    /// only ever shows a complete record. `false` if the path already exists.
    fn publish(&self, record: &LockRecord) -> Result<bool> {
        let tmp = self.sibling("tmp");
        let written = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .and_then(|mut file| {
                file.write_all(serde_json::to_string(record)?.as_bytes())?;
                file.sync_all()
            });
        let linked = written.and_then(|()| fs::hard_link(&tmp, &self.path));
        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %tmp.display(), error = %e, "Failed to remove temporary lock file");
            }
        }

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the abandoned lock out of the way. Returns `false` when the file
    /// moved aside is no longer the one judged abandoned, i.e. another
    /// process reclaimed first; that lock is put back.
    fn set_aside(&self, observed: &str) -> Result<bool> {
        let aside = self.sibling("stale");
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let moved = fs::read_to_string(&aside)?;
        if moved == observed {
            fs::remove_file(&aside)?;
            return Ok(true);
        }

        tracing::warn!(path = %self.path.display(), "Run lock changed hands during reclaim, restoring it");
        let restored = fs::hard_link(&aside, &self.path);
        fs::remove_file(&aside)?;
        match restored {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the lock or fail immediately with [`BackupError::LockHeld`].
    pub fn acquire(&self) -> Result<RunLockGuard> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let host = local_host();
        let record = LockRecord {
            pid: std::process::id() as i32,
            host: host.clone(),
            acquired_at: Utc::now(),
        };

        // One reclaim attempt; losing the race afterwards means someone else holds it.
        for _ in 0..2 {
            if self.publish(&record)? {
                tracing::debug!(path = %self.path.display(), pid = record.pid, "Run lock acquired");
                return Ok(RunLockGuard {
                    path: self.path.clone(),
                    record,
                });
            }

            let observed = match fs::read_to_string(&self.path) {
                Ok(content) => content,
                // Released between our link and read.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            match serde_json::from_str::<LockRecord>(&observed).ok() {
                Some(owner) if owner_alive(&owner, &host) => {
                    return Err(BackupError::LockHeld {
                        path: self.path.clone(),
                        pid: owner.pid,
                        host: owner.host,
                    });
                }
                Some(owner) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        pid = owner.pid,
                        acquired_at = %owner.acquired_at,
                        "Reclaiming run lock from dead process"
                    );
                }
                None => {
                    tracing::warn!(path = %self.path.display(), "Reclaiming unreadable run lock");
                }
            }

            if !self.set_aside(&observed)? {
                break;
            }
        }

        let owner = read_record(&self.path).ok().flatten();
        Err(BackupError::LockHeld {
            path: self.path.clone(),
            pid: owner.as_ref().map(|o| o.pid).unwrap_or(0),
            host: owner.map(|o| o.host).unwrap_or_default(),
        })
    }
}

impl RunLockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        // Only remove the file if it is still ours.
        match read_record(&self.path) {
            Ok(Some(current)) if current == self.record => {
                if let Err(e) = fs::remove_file(&self.path) {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
                } else {
                    tracing::debug!(path = %self.path.display(), "Run lock released");
                }
            }
            Ok(_) => {
                tracing::warn!(path = %self.path.display(), "Run lock was taken over, leaving it in place");
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Run lock vanished before release");
            }
        }
    }
}
