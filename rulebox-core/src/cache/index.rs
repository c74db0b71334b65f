//! Per-registry cache index (`registries/{registryKey}/index.json`)
//!
//! Records every cached ruleset and version with creation, update and access
//! times. It is the source of truth for TTL decisions; payload bytes live in
//! the version directories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::fsutil::{is_expired, read_json, write_json};
use super::layout::CacheLayout;
use super::normalize::RegistryKind;
use crate::error::Result;

/// The cache index for one registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryIndex {
    pub created_on: String,
    pub last_updated_on: String,
    pub last_accessed_on: String,
    /// Normalized registry locator
    pub normalized_url: String,
    pub registry_type: RegistryKind,
    /// Cached rulesets keyed by ruleset or patterns key
    #[serde(default)]
    pub rulesets: BTreeMap<String, RulesetCacheEntry>,
}

/// A cached ruleset within a registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesetCacheEntry {
    /// Original ruleset name (non-Git registries)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset_name: Option<String>,
    /// Original pattern list (Git registries)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patterns: Option<Vec<String>>,
    pub created_on: String,
    pub last_updated_on: String,
    pub last_accessed_on: String,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionCacheEntry>,
}

/// Timestamps for one cached version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionCacheEntry {
    pub created_on: String,
    pub last_updated_on: String,
    pub last_accessed_on: String,
}

/// How a ruleset is identified for display in the index
#[derive(Debug, Clone, PartialEq)]
pub enum RulesetLabel {
    Name(String),
    Patterns(Vec<String>),
}

impl VersionCacheEntry {
    fn new(now: &str) -> Self {
        Self {
            created_on: now.to_string(),
            last_updated_on: now.to_string(),
            last_accessed_on: now.to_string(),
        }
    }
}

impl RulesetCacheEntry {
    fn new(label: RulesetLabel, now: &str) -> Self {
        let (ruleset_name, patterns) = match label {
            RulesetLabel::Name(name) => (Some(name), None),
            RulesetLabel::Patterns(patterns) => (None, Some(patterns)),
        };
        Self {
            ruleset_name,
            patterns,
            created_on: now.to_string(),
            last_updated_on: now.to_string(),
            last_accessed_on: now.to_string(),
            versions: BTreeMap::new(),
        }
    }
}

impl RegistryIndex {
    /// Create an empty index for a registry
    pub fn new(registry_type: RegistryKind, normalized_url: &str, now: &str) -> Self {
        Self {
            created_on: now.to_string(),
            last_updated_on: now.to_string(),
            last_accessed_on: now.to_string(),
            normalized_url: normalized_url.to_string(),
            registry_type,
            rulesets: BTreeMap::new(),
        }
    }

    /// Load a registry's index
    ///
    /// Returns `CacheError::NotFound` when the file is absent and
    /// `CacheError::Corrupt` when it cannot be parsed.
    pub fn load(layout: &CacheLayout, registry_key: &str) -> Result<Self> {
        read_json(&layout.index_path(registry_key), "registry index")
    }

    /// Write the index, creating parent directories as needed
    pub fn save(&self, layout: &CacheLayout, registry_key: &str) -> Result<()> {
        write_json(&layout.index_path(registry_key), self, "registry index")
    }

    /// Insert or refresh a ruleset/version after its files were stored
    pub fn record_store(&mut self, ruleset_key: &str, label: RulesetLabel, version: &str, now: &str) {
        let ruleset = self
            .rulesets
            .entry(ruleset_key.to_string())
            .or_insert_with(|| RulesetCacheEntry::new(label.clone(), now));

        match label {
            RulesetLabel::Name(name) => ruleset.ruleset_name = Some(name),
            RulesetLabel::Patterns(patterns) => ruleset.patterns = Some(patterns),
        }
        ruleset.last_updated_on = now.to_string();
        ruleset.last_accessed_on = now.to_string();

        ruleset
            .versions
            .entry(version.to_string())
            .and_modify(|v| v.last_accessed_on = now.to_string())
            .or_insert_with(|| VersionCacheEntry::new(now));

        self.last_updated_on = now.to_string();
        self.last_accessed_on = now.to_string();
    }

    /// Bump access times for a version, its ruleset and the registry
    ///
    /// The registry timestamp is bumped even when the ruleset or version is not
    /// tracked; returns whether the version entry itself was found.
    pub fn record_access(&mut self, ruleset_key: &str, version: &str, now: &str) -> bool {
        self.last_accessed_on = now.to_string();

        let Some(ruleset) = self.rulesets.get_mut(ruleset_key) else {
            return false;
        };
        ruleset.last_accessed_on = now.to_string();

        match ruleset.versions.get_mut(version) {
            Some(entry) => {
                entry.last_accessed_on = now.to_string();
                true
            }
            None => false,
        }
    }

    /// Drop a version; removes the ruleset too when it has no versions left
    ///
    /// Returns true when the ruleset entry was removed as a result.
    pub fn remove_version(&mut self, ruleset_key: &str, version: &str) -> bool {
        let Some(ruleset) = self.rulesets.get_mut(ruleset_key) else {
            return false;
        };
        ruleset.versions.remove(version);
        if ruleset.versions.is_empty() {
            self.rulesets.remove(ruleset_key);
            return true;
        }
        false
    }

    /// Whether the registry was accessed within `ttl` of `now`
    ///
    /// A zero TTL means entries never go stale.
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        ttl.is_zero() || !is_expired(&self.last_accessed_on, ttl, now)
    }

    pub fn version_count(&self) -> usize {
        self.rulesets.values().map(|r| r.versions.len()).sum()
    }
}
