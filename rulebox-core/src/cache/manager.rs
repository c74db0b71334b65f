//! One cache handle per registry kind, selected at construction

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use super::config::CacheOptions;
use super::eviction::{Evictor, SizeCleanupReport, TtlCleanupReport};
use super::git::GitRegistryCache;
use super::normalize::RegistryKind;
use super::ruleset::RulesetRegistryCache;
use super::store::{CachedRuleset, RulesetFiles, RulesetRef};
use crate::error::Result;

/// Combined result of `RegistryCache::cleanup`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub ttl: TtlCleanupReport,
    pub size: SizeCleanupReport,
}

/// Registry cache for a single registry kind
///
/// Git registries key cached rulesets by their pattern set; every other kind
/// keys them by ruleset name. All variants share one cache root layout.
#[derive(Debug, Clone)]
pub enum RegistryCache {
    Git(GitRegistryCache),
    GitLab(RulesetRegistryCache),
    S3(RulesetRegistryCache),
    Https(RulesetRegistryCache),
    Local(RulesetRegistryCache),
}

impl RegistryCache {
    pub fn new(kind: RegistryKind, options: CacheOptions) -> Self {
        match kind {
            RegistryKind::Git => RegistryCache::Git(GitRegistryCache::new(options)),
            RegistryKind::GitLab => {
                RegistryCache::GitLab(RulesetRegistryCache::with_kind(kind, options))
            }
            RegistryKind::S3 => RegistryCache::S3(RulesetRegistryCache::with_kind(kind, options)),
            RegistryKind::Https => {
                RegistryCache::Https(RulesetRegistryCache::with_kind(kind, options))
            }
            RegistryKind::Local => {
                RegistryCache::Local(RulesetRegistryCache::with_kind(kind, options))
            }
        }
    }

    pub fn kind(&self) -> RegistryKind {
        match self {
            RegistryCache::Git(_) => RegistryKind::Git,
            RegistryCache::GitLab(c)
            | RegistryCache::S3(c)
            | RegistryCache::Https(c)
            | RegistryCache::Local(c) => c.kind(),
        }
    }

    pub fn store(
        &self,
        locator: &str,
        ruleset: &RulesetRef,
        version: &str,
        files: &RulesetFiles,
    ) -> Result<PathBuf> {
        match self {
            RegistryCache::Git(c) => c.store(locator, ruleset, version, files),
            RegistryCache::GitLab(c)
            | RegistryCache::S3(c)
            | RegistryCache::Https(c)
            | RegistryCache::Local(c) => c.store(locator, ruleset, version, files),
        }
    }

    /// Read a cached version; `CacheError::NotFound` signals a miss
    pub fn get(&self, locator: &str, ruleset: &RulesetRef, version: &str) -> Result<CachedRuleset> {
        match self {
            RegistryCache::Git(c) => c.get(locator, ruleset, version),
            RegistryCache::GitLab(c)
            | RegistryCache::S3(c)
            | RegistryCache::Https(c)
            | RegistryCache::Local(c) => c.get(locator, ruleset, version),
        }
    }

    /// Where a version is (or would be) cached, without touching the disk
    pub fn get_path(&self, locator: &str, ruleset: &RulesetRef, version: &str) -> Result<PathBuf> {
        match self {
            RegistryCache::Git(c) => c.get_path(locator, ruleset, version),
            RegistryCache::GitLab(c)
            | RegistryCache::S3(c)
            | RegistryCache::Https(c)
            | RegistryCache::Local(c) => c.get_path(locator, ruleset, version),
        }
    }

    pub fn is_valid(&self, locator: &str, ttl: Duration) -> bool {
        match self {
            RegistryCache::Git(c) => c.is_valid(locator, ttl),
            RegistryCache::GitLab(c)
            | RegistryCache::S3(c)
            | RegistryCache::Https(c)
            | RegistryCache::Local(c) => c.is_valid(locator, ttl),
        }
    }

    /// Persistent clone location; only Git registries have one
    pub fn repository_path(&self, locator: &str) -> Option<PathBuf> {
        match self {
            RegistryCache::Git(c) => Some(c.repository_path(locator)),
            _ => None,
        }
    }

    /// Run the TTL sweep and then the size sweep over the shared cache root
    pub fn cleanup(&self, ttl: Duration, max_size_bytes: u64) -> Result<CleanupReport> {
        let evictor = Evictor::new(self.options());
        let ttl = evictor.cleanup_by_ttl(ttl)?;
        let size = evictor.cleanup_by_size(max_size_bytes)?;
        Ok(CleanupReport { ttl, size })
    }

    fn options(&self) -> &CacheOptions {
        match self {
            RegistryCache::Git(c) => c.options(),
            RegistryCache::GitLab(c)
            | RegistryCache::S3(c)
            | RegistryCache::Https(c)
            | RegistryCache::Local(c) => c.options(),
        }
    }
}
