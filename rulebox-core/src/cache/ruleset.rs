//! Cache for name-addressed registries (GitLab packages, S3, HTTPS, local paths)
//!
//! Cache slots are keyed by the ruleset name, and versions are the resolved
//! version strings handed in by the caller.

use std::path::PathBuf;
use std::time::Duration;

use super::config::CacheOptions;
use super::index::RulesetLabel;
use super::keys::ruleset_key;
use super::normalize::RegistryKind;
use super::store::{CachedRuleset, RulesetFiles, RulesetRef, RulesetSlot, VersionStore};
use crate::error::{CacheError, Result};

/// Content-addressed cache for registries that serve named rulesets
#[derive(Debug, Clone)]
pub struct RulesetRegistryCache {
    store: VersionStore,
}

impl RulesetRegistryCache {
    /// Create a cache for a non-Git registry kind
    pub fn new(kind: RegistryKind, options: CacheOptions) -> Result<Self> {
        if kind.is_git() {
            return Err(CacheError::InvalidInput(
                "git registries are keyed by patterns; use GitRegistryCache".to_string(),
            ));
        }
        Ok(Self::with_kind(kind, options))
    }

    pub(crate) fn with_kind(kind: RegistryKind, options: CacheOptions) -> Self {
        Self {
            store: VersionStore::new(kind, options),
        }
    }

    pub fn kind(&self) -> RegistryKind {
        self.store.kind()
    }

    pub fn store(
        &self,
        locator: &str,
        ruleset: &RulesetRef,
        version: &str,
        files: &RulesetFiles,
    ) -> Result<PathBuf> {
        self.store.store(locator, &slot(ruleset)?, version, files)
    }

    pub fn get(&self, locator: &str, ruleset: &RulesetRef, version: &str) -> Result<CachedRuleset> {
        self.store.get(locator, &slot(ruleset)?, version)
    }

    pub fn get_path(&self, locator: &str, ruleset: &RulesetRef, version: &str) -> Result<PathBuf> {
        let slot = slot(ruleset)?;
        self.store.version_path(locator, &slot.key, version)
    }

    pub fn is_valid(&self, locator: &str, ttl: Duration) -> bool {
        self.store.is_valid(locator, ttl)
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
        key: ruleset_key(name),
        label: RulesetLabel::Name(name.to_string()),
        name: name.to_string(),
        patterns: ruleset.patterns.clone(),
    })
}
