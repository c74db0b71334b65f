//! Cache for Git registries
//!
//! Versions are commit hashes, and the cache slot is keyed by the pattern set
//! used to select files, so the same ruleset checked out with different
//! patterns occupies distinct slots. Each registry also gets a stable
//! `repository/` directory for a persistent clone.

use std::path::PathBuf;
use std::time::Duration;

use super::config::CacheOptions;
use super::index::RulesetLabel;
use super::keys::patterns_key;
use super::normalize::RegistryKind;
use super::store::{CachedRuleset, RulesetFiles, RulesetRef, RulesetSlot, VersionStore};
use crate::error::{CacheError, Result};

/// Content-addressed cache for one or more Git registries
#[derive(Debug, Clone)]
pub struct GitRegistryCache {
    store: VersionStore,
}

impl GitRegistryCache {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            store: VersionStore::new(RegistryKind::Git, options),
        }
    }

    /// Cache the files selected by `ruleset.patterns` at `commit`
    pub fn store(
        &self,
        repo_url: &str,
        ruleset: &RulesetRef,
        commit: &str,
        files: &RulesetFiles,
    ) -> Result<PathBuf> {
        self.store.store(repo_url, &slot(ruleset)?, commit, files)
    }

    /// Read back the files cached for `ruleset.patterns` at `commit`
    pub fn get(&self, repo_url: &str, ruleset: &RulesetRef, commit: &str) -> Result<CachedRuleset> {
        self.store.get(repo_url, &slot(ruleset)?, commit)
    }

    /// Directory holding the cached files for a pattern set at `commit`
    pub fn get_path(&self, repo_url: &str, ruleset: &RulesetRef, commit: &str) -> Result<PathBuf> {
        self.store.version_path(repo_url, &slot(ruleset)?.key, commit)
    }

    /// Stable location for a persistent clone, independent of any commit
    pub fn repository_path(&self, repo_url: &str) -> PathBuf {
        self.store
            .layout()
            .repository_dir(&self.store.registry_key(repo_url))
    }

    pub fn is_valid(&self, repo_url: &str, ttl: Duration) -> bool {
        self.store.is_valid(repo_url, ttl)
    }

    pub(crate) fn options(&self) -> &CacheOptions {
        self.store.options()
    }
}

fn slot(ruleset: &RulesetRef) -> Result<RulesetSlot> {
    let name = ruleset.name.trim();
    if name.is_empty() {
        return Err(CacheError::InvalidInput(
            "ruleset name must not be empty".to_string(),
        ));
    }

    Ok(RulesetSlot {
        key: patterns_key(&ruleset.patterns),
        label: RulesetLabel::Patterns(ruleset.patterns.clone()),
        name: name.to_string(),
        patterns: ruleset.patterns.clone(),
    })
}
