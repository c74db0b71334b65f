//! On-disk layout of the cache root
//!
//! ```text
//! <root>/config.json
//! <root>/registry-map.json
//! <root>/ruleset-map.json
//! <root>/locks/{registryKey}.lock
//! <root>/locks/mappings.lock
//! <root>/registries/{registryKey}/index.json
//! <root>/registries/{registryKey}/repository/
//! <root>/registries/{registryKey}/rulesets/{rulesetKey}/{version}/**
//! ```

use std::path::{Path, PathBuf};

pub const REGISTRIES_DIR: &str = "registries";
pub const RULESETS_DIR: &str = "rulesets";
pub const REPOSITORY_DIR: &str = "repository";
pub const LOCKS_DIR: &str = "locks";
pub const INDEX_FILE: &str = "index.json";
pub const REGISTRY_MAP_FILE: &str = "registry-map.json";
pub const RULESET_MAP_FILE: &str = "ruleset-map.json";

/// Lock key shared by both mapping documents
pub const MAPPINGS_LOCK: &str = "mappings";

/// Path builder rooted at a cache directory
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registries_dir(&self) -> PathBuf {
        self.root.join(REGISTRIES_DIR)
    }

    pub fn registry_dir(&self, registry_key: &str) -> PathBuf {
        self.registries_dir().join(registry_key)
    }

    pub fn index_path(&self, registry_key: &str) -> PathBuf {
        self.registry_dir(registry_key).join(INDEX_FILE)
    }

    /// Stable location for a persistent clone of a Git registry
    pub fn repository_dir(&self, registry_key: &str) -> PathBuf {
        self.registry_dir(registry_key).join(REPOSITORY_DIR)
    }

    pub fn rulesets_dir(&self, registry_key: &str) -> PathBuf {
        self.registry_dir(registry_key).join(RULESETS_DIR)
    }

    pub fn ruleset_dir(&self, registry_key: &str, ruleset_key: &str) -> PathBuf {
        self.rulesets_dir(registry_key).join(ruleset_key)
    }

    pub fn version_dir(&self, registry_key: &str, ruleset_key: &str, version: &str) -> PathBuf {
        self.ruleset_dir(registry_key, ruleset_key).join(version)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    pub fn lock_path(&self, registry_key: &str) -> PathBuf {
        self.locks_dir().join(format!("{registry_key}.lock"))
    }

    pub fn registry_map_path(&self) -> PathBuf {
        self.root.join(REGISTRY_MAP_FILE)
    }

    pub fn ruleset_map_path(&self) -> PathBuf {
        self.root.join(RULESET_MAP_FILE)
    }
}
