//! Cache configuration
//!
//! `CacheOptions` is the in-process configuration handed to every constructor.
//! `CacheConfig` is the persisted `config.json` at the cache root holding the
//! TTL, size budget and cleanup switch shared by all invocations.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::fsutil::{now_rfc3339, read_json, write_json_atomic};
use crate::error::{CacheError, Result};

/// Config file name at the cache root
pub const CONFIG_FILE: &str = "config.json";

/// Schema version written to new config files
pub const CONFIG_VERSION: &str = "1.0";

pub const DEFAULT_TTL_HOURS: u64 = 24;
pub const DEFAULT_MAX_SIZE_MB: u64 = 1024;

/// Default wait for the registry lock during store and cleanup
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wait for the registry lock when refreshing access times on read
pub const DEFAULT_ACCESS_REFRESH_TIMEOUT: Duration = Duration::from_secs(2);

/// Explicit cache settings passed into every manager
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Root of the on-disk cache hierarchy
    pub root: PathBuf,
    /// How long `store` and `cleanup` wait for a registry lock
    pub lock_timeout: Duration,
    /// How long `get` waits for a registry lock before skipping its access refresh
    pub access_refresh_timeout: Duration,
}

impl CacheOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            access_refresh_timeout: DEFAULT_ACCESS_REFRESH_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_access_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.access_refresh_timeout = timeout;
        self
    }

    /// Platform cache directory for rulebox (e.g. `~/.cache/rulebox`)
    ///
    /// Only used to fill in a root when the caller has none; nothing in the
    /// engine reads it implicitly.
    pub fn default_root() -> Result<PathBuf> {
        directories::ProjectDirs::from("dev", "rulebox", "rulebox")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .or_else(|| dirs::cache_dir().map(|d| d.join("rulebox")))
            .ok_or_else(|| {
                CacheError::InvalidInput("could not determine a cache directory".to_string())
            })
    }
}

/// Persisted global cache settings (`<root>/config.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Schema version for compatibility
    pub version: String,
    pub created_on: String,
    pub updated_on: String,
    /// Entries not accessed within this many hours are evicted
    pub ttl_hours: u64,
    /// Size budget for the whole cache root
    pub max_size_mb: u64,
    /// Whether maintenance sweeps run at all
    pub cleanup_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let now = now_rfc3339();
        Self {
            version: CONFIG_VERSION.to_string(),
            created_on: now.clone(),
            updated_on: now,
            ttl_hours: DEFAULT_TTL_HOURS,
            max_size_mb: DEFAULT_MAX_SIZE_MB,
            cleanup_enabled: true,
        }
    }
}

impl CacheConfig {
    pub fn path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }

    /// Load `config.json`, creating it with defaults if it does not exist yet
    pub fn load_or_init(root: &Path) -> Result<Self> {
        let path = Self::path(root);
        match read_json::<CacheConfig>(&path, "cache config") {
            Ok(config) => Ok(config),
            Err(e) if e.is_not_found() => {
                let config = CacheConfig::default();
                write_json_atomic(&path, &config, "cache config")?;
                tracing::debug!("Created default cache config at {}", path.display());
                Ok(config)
            }
            Err(e) => Err(e),
        }
    }

    /// Persist the config, bumping `updatedOn`
    pub fn save(&mut self, root: &Path) -> Result<()> {
        self.updated_on = now_rfc3339();
        write_json_atomic(&Self::path(root), self, "cache config")
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours.saturating_mul(3600))
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}
