//! Cache engine error types
//!
//! Not-found conditions are kept distinct from real failures so callers can
//! run miss-then-fetch logic with a plain `match` instead of inspecting I/O kinds.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the registry cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// An index, mapping document, or version directory does not exist
    #[error("{what} not found: {path}")]
    NotFound { what: &'static str, path: PathBuf },

    /// A JSON document exists but could not be parsed
    #[error("{what} is corrupted or has an invalid format: {path}")]
    Corrupt {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Another process held the registry lock for the whole wait window
    #[error("Timed out after {waited:?} waiting for lock on registry {registry_key}\n\nLock file: {path}\nIf no other rulebox process is running, the lock becomes stale after one hour or can be removed by hand.")]
    LockTimeout {
        registry_key: String,
        path: PathBuf,
        waited: Duration,
    },

    /// Permission, disk, create, write or rename failure
    #[error("I/O failure on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Caller supplied an identifier or record that cannot be used
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Failed to encode a document before writing it
    #[error("Failed to serialize {what}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    /// Wrap an I/O error with the path it concerned
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn not_found(what: &'static str, path: impl AsRef<Path>) -> Self {
        CacheError::NotFound {
            what,
            path: path.as_ref().to_path_buf(),
        }
    }

    /// True for the expected "absent" condition, which is a cache miss rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, CacheError::LockTimeout { .. })
    }
}
