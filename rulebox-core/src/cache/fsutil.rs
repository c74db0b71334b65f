//! Filesystem helpers shared by the cache stores
//!
//! JSON metadata goes through `write_json_atomic`, which renames a fully written
//! temp file over the destination so readers never see a partial document.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Component, Path};
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Current time as an RFC3339 UTC string, the format of every persisted timestamp
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a persisted timestamp; `None` when it is not valid RFC3339
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Whether `timestamp` is at least `ttl` old as of `now`
///
/// Unparsable timestamps count as expired.
pub fn is_expired(timestamp: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
    match parse_timestamp(timestamp) {
        Some(t) => match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(t) >= ttl,
            Err(_) => false,
        },
        None => true,
    }
}

/// Write `bytes` to a temp file next to `path` and rename it into place
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| CacheError::io(parent, e))?;
    temp.write_all(bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| CacheError::io(temp.path(), e))?;

    // On failure the temp file is removed when the returned handle drops
    temp.persist(path).map_err(|e| CacheError::io(path, e.error))?;
    Ok(())
}

/// Serialize `value` as indented JSON and write it atomically
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T, what: &'static str) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)
        .map_err(|source| CacheError::Serialize { what, source })?;
    atomic_write(path, &content)
}

/// Serialize `value` as indented JSON and overwrite `path` in place
pub fn write_json<T: Serialize>(path: &Path, value: &T, what: &'static str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }
    let content = serde_json::to_vec_pretty(value)
        .map_err(|source| CacheError::Serialize { what, source })?;
    std::fs::write(path, content).map_err(|e| CacheError::io(path, e))
}

/// Read and parse a JSON document, distinguishing absent from corrupt
pub fn read_json<T: DeserializeOwned>(path: &Path, what: &'static str) -> Result<T> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CacheError::not_found(what, path));
        }
        Err(e) => return Err(CacheError::io(path, e)),
    };

    serde_json::from_slice(&content).map_err(|source| CacheError::Corrupt {
        what,
        path: path.to_path_buf(),
        source,
    })
}

/// Remove a directory tree, treating "already gone" as success
pub fn remove_dir_all_tolerant(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

/// Remove a file, treating "already gone" as success
pub fn remove_file_tolerant(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

/// Total size in bytes of all regular files under `path`
///
/// Entries that vanish mid-walk are skipped; a missing root is zero.
pub fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Names of the immediate subdirectories of `path`; empty if `path` is absent
pub fn list_subdirs(path: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CacheError::io(path, e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(path, e))?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Reject version strings that would not be a single safe path segment
pub fn validate_version(version: &str) -> Result<()> {
    let trimmed = version.trim();
    if trimmed.is_empty()
        || trimmed != version
        || version == "."
        || version == ".."
        || version.contains('/')
        || version.contains('\\')
    {
        return Err(CacheError::InvalidInput(format!(
            "version '{version}' is not usable as a cache directory name"
        )));
    }
    Ok(())
}

/// Reject stored file paths that are absolute or climb out of the version directory
pub fn validate_relative_path(relative: &str) -> Result<()> {
    let path = Path::new(relative);
    let only_normal = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

    if relative.is_empty() || relative.contains('\\') || !only_normal {
        return Err(CacheError::InvalidInput(format!(
            "file path '{relative}' must be relative and stay inside the version directory"
        )));
    }
    Ok(())
}
