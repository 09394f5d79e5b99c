/*
[INPUT]:  Monitor records and the auxiliary task index
[OUTPUT]: Crash-safe JSON document on disk with lock, backup, and recovery
[POS]:    Persistence layer - single store file shared by all components
[UPDATE]: When the document schema, lock policy, or backup policy change
*/

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::monitor::Monitor;

/// How long the lock acquire loop waits before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// A lock file older than this belongs to a dead process and is taken over.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Minimum interval between backup snapshots.
const BACKUP_MIN_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("could not acquire store lock at {path} within {timeout:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },
}

/// Auxiliary per-monitor note kept alongside the monitor map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskNote {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_ref: Option<String>,
    #[serde(default)]
    pub note: String,
}

/// The single serialized document: monitor records plus a task index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub monitors: BTreeMap<String, Monitor>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskNote>,
}

impl StoreDocument {
    /// Re-key every monitor under its canonical storage key. Legacy keys
    /// lacking the account-role suffix are rewritten in place.
    ///
    /// A legacy record and a canonical record can collide on the same key;
    /// the canonical one wins the slot and the displaced record is returned
    /// so the caller can hand it to the position merger.
    fn migrate_keys(&mut self) -> Vec<Monitor> {
        let monitors = std::mem::take(&mut self.monitors);
        let mut displaced = Vec::new();
        for (raw_key, monitor) in monitors {
            let canonical = monitor.key.storage_key();
            if raw_key != canonical {
                tracing::info!(from = %raw_key, to = %canonical, "migrated legacy store key");
                if let Some(task) = self.tasks.remove(&raw_key) {
                    self.tasks.entry(canonical.clone()).or_insert(task);
                }
            }
            match self.monitors.entry(canonical.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(monitor);
                }
                Entry::Occupied(mut slot) => {
                    tracing::warn!(
                        key = %canonical,
                        "duplicate monitor records in store, queueing for merge"
                    );
                    if raw_key == canonical {
                        displaced.push(slot.insert(monitor));
                    } else {
                        displaced.push(monitor);
                    }
                }
            }
        }
        displaced
    }
}

/// Sidecar lock file guarding the store. Mutual exclusion only; the file
/// holds the owner pid for diagnostics, never payload.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(path: &Path) -> Result<Self, StorageError> {
        Self::acquire_with_timeout(path, LOCK_TIMEOUT)
    }

    pub fn acquire_with_timeout(path: &Path, timeout: Duration) -> Result<Self, StorageError> {
        let deadline = SystemTime::now() + timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(path) {
                        tracing::warn!(path = %path.display(), "taking over stale store lock");
                        let _ = fs::remove_file(path);
                        continue;
                    }
                }
                Err(err) => return Err(err.into()),
            }

            if SystemTime::now() >= deadline {
                return Err(StorageError::LockTimeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            std::thread::sleep(LOCK_RETRY_DELAY);
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    modified
        .elapsed()
        .map(|age| age > LOCK_STALE_AFTER)
        .unwrap_or(false)
}

/// Crash-safe JSON store for the monitor registry.
///
/// Every save goes through a temp file in the same directory and an atomic
/// rename, so the store on disk is always a complete document.
#[derive(Debug, Clone)]
pub struct PersistedStore {
    path: PathBuf,
    backup_path: PathBuf,
    lock_path: PathBuf,
}

impl PersistedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let backup_path = path.with_extension("backup.json");
        let lock_path = path.with_extension("lock");
        Self {
            path,
            backup_path,
            lock_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, falling back to the backup snapshot on a corrupt
    /// store, and to an empty document as last resort. Never fails on bad
    /// content, only on I/O or lock problems.
    ///
    /// The second element holds records displaced by key migration; the
    /// caller decides how to consolidate them.
    pub fn load(&self) -> Result<(StoreDocument, Vec<Monitor>), StorageError> {
        let _lock = FileLock::acquire(&self.lock_path)?;

        let mut document = match self.read_document(&self.path) {
            Ok(Some(document)) => document,
            Ok(None) => StoreDocument::default(),
            Err(err) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %err,
                    "store corrupted, trying backup snapshot"
                );
                match self.read_document(&self.backup_path) {
                    Ok(Some(document)) => document,
                    Ok(None) => {
                        tracing::warn!("no backup snapshot, starting from empty store");
                        StoreDocument::default()
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            path = %self.backup_path.display(),
                            error = %backup_err,
                            "backup snapshot also corrupted, starting from empty store"
                        );
                        StoreDocument::default()
                    }
                }
            }
        };

        let displaced = document.migrate_keys();
        Ok((document, displaced))
    }

    /// Save the document: snapshot the previous store (rate-limited), then
    /// write a temp file and atomically rename it over the store.
    pub fn save(&self, document: &StoreDocument) -> Result<(), StorageError> {
        let _lock = FileLock::acquire(&self.lock_path)?;

        self.maybe_snapshot();

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp_file = NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut temp_file, document)?;
        temp_file.flush()?;
        temp_file
            .persist(&self.path)
            .map_err(|err| StorageError::Io(err.error))?;

        tracing::debug!(
            path = %self.path.display(),
            monitors = document.monitors.len(),
            "store saved"
        );
        Ok(())
    }

    fn read_document(&self, path: &Path) -> Result<Option<StoreDocument>, StorageError> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Copy the current store to the backup path, at most once per interval.
    fn maybe_snapshot(&self) {
        if !self.path.exists() {
            return;
        }
        let due = match fs::metadata(&self.backup_path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified
                .elapsed()
                .map(|age| age > BACKUP_MIN_INTERVAL)
                .unwrap_or(true),
            Err(_) => true,
        };
        if !due {
            return;
        }
        if let Err(err) = fs::copy(&self.path, &self.backup_path) {
            tracing::warn!(
                path = %self.backup_path.display(),
                error = %err,
                "backup snapshot failed"
            );
        }
    }
}
