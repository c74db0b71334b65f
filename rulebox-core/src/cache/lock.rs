//! Advisory per-registry locks (`locks/{registryKey}.lock`)
//!
//! Cooperative mutual exclusion across processes sharing one cache root. A
//! lock file holds a JSON `LockInfo`; it is created with an exclusive
//! rename-if-absent so exactly one acquirer wins. Locks older than an hour, or
//! whose contents cannot be parsed, are presumed abandoned and may be removed
//! by the next acquirer.
//!
//! The lock guards read-modify-write of the registry index and mapping
//! documents. Payload writes do not need it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::fsutil::{parse_timestamp, remove_file_tolerant};
use super::layout::CacheLayout;
use crate::error::{CacheError, Result};

/// Interval between acquisition attempts
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Age after which a lock is presumed abandoned
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(60 * 60);

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    /// RFC3339 UTC creation time
    pub created_at: String,
    /// What the holder is doing, for diagnostics
    pub operation: String,
}

impl LockInfo {
    fn for_current_process(operation: &str) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            pid: std::process::id(),
            hostname,
            created_at: Utc::now().to_rfc3339(),
            operation: operation.to_string(),
        }
    }

    /// Whether the lock is older than `STALE_LOCK_AGE` (or has no readable timestamp)
    ///
    /// A timestamp in the future is measured by its distance from `now`, so a
    /// lock written by a host whose clock runs ahead still expires.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match parse_timestamp(&self.created_at) {
            Some(created) => {
                let age = now.signed_duration_since(created);
                let age = if age < chrono::Duration::zero() { -age } else { age };
                age.to_std().map(|age| age > STALE_LOCK_AGE).unwrap_or(true)
            }
            None => true,
        }
    }
}

/// Observed state of a registry lock file
#[derive(Debug, Clone, PartialEq)]
pub enum LockState {
    /// No lock file
    Unheld,
    /// A fresh, parseable lock file
    Held(LockInfo),
    /// A lock file that is too old or unreadable
    Stale,
}

/// Read the lock file at `path` and classify it
pub fn inspect_lock(path: &Path) -> Result<LockState> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockState::Unheld),
        Err(e) => return Err(CacheError::io(path, e)),
    };

    match serde_json::from_slice::<LockInfo>(&content) {
        Ok(info) if !info.is_stale(Utc::now()) => Ok(LockState::Held(info)),
        Ok(_) | Err(_) => Ok(LockState::Stale),
    }
}

/// Hands out lock handles for registries under one cache root
#[derive(Debug, Clone)]
pub struct LockManager {
    layout: CacheLayout,
}

impl LockManager {
    pub fn new(layout: CacheLayout) -> Self {
        Self { layout }
    }

    /// An unheld handle for a registry's lock
    pub fn lock(&self, registry_key: &str) -> RegistryLock {
        RegistryLock {
            registry_key: registry_key.to_string(),
            path: self.layout.lock_path(registry_key),
            held: None,
        }
    }

    pub fn state(&self, registry_key: &str) -> Result<LockState> {
        inspect_lock(&self.layout.lock_path(registry_key))
    }
}

/// A handle on one registry's lock file
///
/// Dropping a held handle releases it.
#[derive(Debug)]
pub struct RegistryLock {
    registry_key: String,
    path: PathBuf,
    held: Option<LockInfo>,
}

impl RegistryLock {
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, polling every `LOCK_POLL_INTERVAL` until `timeout` elapses
    ///
    /// A stale lock found on entry is removed first. Acquiring a handle that is
    /// already held is a no-op.
    pub fn acquire(&mut self, operation: &str, timeout: Duration) -> Result<()> {
        if self.is_held() {
            return Ok(());
        }

        self.remove_if_stale()?;

        let started = Instant::now();
        loop {
            let info = LockInfo::for_current_process(operation);
            if self.try_create(&info)? {
                tracing::debug!(
                    "Acquired lock for registry {} ({})",
                    self.registry_key,
                    operation
                );
                self.held = Some(info);
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(CacheError::LockTimeout {
                    registry_key: self.registry_key.clone(),
                    path: self.path.clone(),
                    waited,
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL.min(timeout - waited));
        }
    }

    /// Release the lock if this handle holds it
    ///
    /// Releasing an unheld handle, or a lock file that is already gone, succeeds.
    pub fn release(&mut self) -> Result<()> {
        let Some(ours) = self.held.take() else {
            return Ok(());
        };

        // Leave the file alone if a later acquirer took it over as stale
        if let Ok(LockState::Held(current)) = inspect_lock(&self.path) {
            if current != ours {
                tracing::warn!(
                    "Lock for registry {} was taken over by pid {} on {}; not removing it",
                    self.registry_key,
                    current.pid,
                    current.hostname
                );
                return Ok(());
            }
        }

        remove_file_tolerant(&self.path)?;
        tracing::debug!("Released lock for registry {}", self.registry_key);
        Ok(())
    }

    fn remove_if_stale(&self) -> Result<()> {
        if inspect_lock(&self.path)? == LockState::Stale {
            self.retire_stale()?;
        }
        Ok(())
    }

    /// Move the lock file to a unique tombstone, then delete it if it is still stale
    ///
    /// Another acquirer may have replaced the stale file between our inspection
    /// and the rename. A fresh lock found in the tombstone is linked back into
    /// place; if a third acquirer already created a new lock by then, the
    /// displaced holder is left without a file and its release is a no-op.
    fn retire_stale(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| CacheError::InvalidInput("lock path has no parent".to_string()))?;
        let tombstone = tempfile::Builder::new()
            .prefix(".stale-")
            .tempfile_in(dir)
            .map_err(|e| CacheError::io(dir, e))?
            .into_temp_path();

        match std::fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CacheError::io(&self.path, e)),
        }

        if let LockState::Held(info) = inspect_lock(&tombstone)? {
            match std::fs::hard_link(&tombstone, &self.path) {
                Ok(()) => tracing::debug!(
                    "Lock for registry {} was renewed by pid {}; restored it",
                    self.registry_key,
                    info.pid
                ),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => tracing::warn!(
                    "Lock for registry {} held by pid {} was displaced by a newer acquirer",
                    self.registry_key,
                    info.pid
                ),
                Err(e) => return Err(CacheError::io(&self.path, e)),
            }
            return Ok(());
        }

        tracing::info!(
            "Removing stale lock for registry {}: {}",
            self.registry_key,
            self.path.display()
        );
        tombstone.close().map_err(|e| CacheError::io(dir, e))
    }

    /// One exclusive create-if-absent attempt; false when someone else holds it
    fn try_create(&self, info: &LockInfo) -> Result<bool> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| CacheError::InvalidInput("lock path has no parent".to_string()))?;
        std::fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;

        let content = serde_json::to_vec_pretty(info).map_err(|source| CacheError::Serialize {
            what: "lock info",
            source,
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
        temp.write_all(&content)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| CacheError::io(temp.path(), e))?;

        match temp.persist_noclobber(&self.path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(CacheError::io(&self.path, e.error)),
        }
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::debug!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}
