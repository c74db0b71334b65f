//! Version payload storage shared by the Git and ruleset caches
//!
//! Payload files are written to `rulesets/{slotKey}/{version}/` without a lock:
//! a version key is written once and only ever deleted afterwards. The index
//! updates that follow run under the registry lock, and the mapping updates
//! additionally take the shared mappings lock.

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::config::CacheOptions;
use super::fsutil::{now_rfc3339, validate_relative_path, validate_version};
use super::index::{RegistryIndex, RulesetLabel};
use super::keys::registry_key;
use super::layout::CacheLayout;
use super::lock::LockManager;
use super::mapping::{
    RegistryMapping, RegistryMappingStore, RulesetMapping, RulesetMappingStore,
};
use super::normalize::{normalize, RegistryKind};
use crate::error::{CacheError, Result};

/// File contents keyed by forward-slash path relative to the version root
pub type RulesetFiles = BTreeMap<String, Vec<u8>>;

/// Identifies a ruleset within a registry
///
/// Git registries key the cache slot by `patterns`; every other kind keys it by
/// `name`. Both are recorded for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulesetRef {
    pub name: String,
    pub patterns: Vec<String>,
}

impl RulesetRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            patterns: Vec::new(),
        }
    }

    pub fn with_patterns(name: impl Into<String>, patterns: &[&str]) -> Self {
        Self {
            name: name.into(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Outcome of the best-effort access-time refresh done by `get`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessRefresh {
    /// Index and mapping access times were persisted
    Recorded,
    /// The refresh did not happen; the read itself still succeeded
    Skipped { reason: String },
}

/// Files read back from a cached version
#[derive(Debug, Clone)]
pub struct CachedRuleset {
    pub files: RulesetFiles,
    pub access: AccessRefresh,
}

/// A resolved cache slot: the key under `rulesets/` plus what to record about it
#[derive(Debug, Clone)]
pub(crate) struct RulesetSlot {
    pub key: String,
    pub label: RulesetLabel,
    pub name: String,
    pub patterns: Vec<String>,
}

/// Store/get machinery for one registry kind
#[derive(Debug, Clone)]
pub(crate) struct VersionStore {
    kind: RegistryKind,
    options: CacheOptions,
    layout: CacheLayout,
    locks: LockManager,
}

impl VersionStore {
    pub fn new(kind: RegistryKind, options: CacheOptions) -> Self {
        let layout = CacheLayout::new(options.root.clone());
        let locks = LockManager::new(layout.clone());
        Self {
            kind,
            options,
            layout,
            locks,
        }
    }

    pub fn kind(&self) -> RegistryKind {
        self.kind
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn registry_key(&self, locator: &str) -> String {
        registry_key(self.kind, locator)
    }

    pub fn version_path(&self, locator: &str, slot_key: &str, version: &str) -> Result<PathBuf> {
        validate_version(version)?;
        Ok(self
            .layout
            .version_dir(&self.registry_key(locator), slot_key, version))
    }

    /// Write a version's files, then record it in the index and mapping stores
    pub fn store(
        &self,
        locator: &str,
        slot: &RulesetSlot,
        version: &str,
        files: &RulesetFiles,
    ) -> Result<PathBuf> {
        validate_version(version)?;
        for relative in files.keys() {
            validate_relative_path(relative)?;
        }

        let registry_key = self.registry_key(locator);
        let version_dir = self.layout.version_dir(&registry_key, &slot.key, version);
        write_files(&version_dir, files)?;

        let mut lock = self.locks.lock(&registry_key);
        lock.acquire("store", self.options.lock_timeout)?;

        let now = now_rfc3339();
        let mut index = match RegistryIndex::load(&self.layout, &registry_key) {
            Ok(index) => index,
            Err(e) if e.is_not_found() => {
                RegistryIndex::new(self.kind, &normalize(self.kind, locator), &now)
            }
            Err(e) => return Err(e),
        };
        index.record_store(&slot.key, slot.label.clone(), version, &now);
        index.save(&self.layout, &registry_key)?;

        self.record_mappings(locator, &registry_key, slot);

        lock.release()?;

        tracing::debug!(
            "Cached {} {} v{} ({} files) at {}",
            self.kind,
            slot.name,
            version,
            files.len(),
            version_dir.display()
        );
        Ok(version_dir)
    }

    /// Read every file of a cached version
    ///
    /// Fails with `CacheError::NotFound` when the version directory is absent.
    pub fn get(&self, locator: &str, slot: &RulesetSlot, version: &str) -> Result<CachedRuleset> {
        validate_version(version)?;
        let registry_key = self.registry_key(locator);
        let version_dir = self.layout.version_dir(&registry_key, &slot.key, version);

        if !version_dir.is_dir() {
            tracing::debug!("Cache miss for {} {} v{}", self.kind, slot.name, version);
            return Err(CacheError::not_found("cached version", &version_dir));
        }

        let files = read_files(&version_dir)?;
        let access = self.refresh_access(&registry_key, slot, version);

        tracing::debug!(
            "Cache hit for {} {} v{} ({} files)",
            self.kind,
            slot.name,
            version,
            files.len()
        );
        Ok(CachedRuleset { files, access })
    }

    /// Whether the registry was accessed within `ttl`; a zero TTL is always valid
    ///
    /// A missing or unreadable index counts as invalid.
    pub fn is_valid(&self, locator: &str, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return true;
        }

        match RegistryIndex::load(&self.layout, &self.registry_key(locator)) {
            Ok(index) => index.is_fresh(ttl, Utc::now()),
            Err(e) => {
                if !e.is_not_found() {
                    tracing::debug!("Treating registry {} as invalid: {}", locator, e);
                }
                false
            }
        }
    }

    fn refresh_access(&self, registry_key: &str, slot: &RulesetSlot, version: &str) -> AccessRefresh {
        let mut lock = self.locks.lock(registry_key);
        if let Err(e) = lock.acquire("access", self.options.access_refresh_timeout) {
            return skipped(e);
        }

        let mut index = match RegistryIndex::load(&self.layout, registry_key) {
            Ok(index) => index,
            Err(e) => return skipped(e),
        };

        let now = now_rfc3339();
        if !index.record_access(&slot.key, version, &now) {
            tracing::debug!(
                "Version {} of {} is on disk but not in the registry index",
                version,
                slot.key
            );
        }

        if let Err(e) = index.save(&self.layout, registry_key) {
            return skipped(e);
        }

        let timeout = self.options.access_refresh_timeout;
        let registries = self.registry_mappings().with_lock_timeout(timeout);
        if let Err(e) = registries.touch(|m| m.cache_key == registry_key, &now) {
            return skipped(e);
        }
        let rulesets = self.ruleset_mappings().with_lock_timeout(timeout);
        if let Err(e) = rulesets.touch(
            |m| m.cache_key == slot.key && m.registry_key == registry_key,
            &now,
        ) {
            return skipped(e);
        }

        match lock.release() {
            Ok(()) => AccessRefresh::Recorded,
            Err(e) => skipped(e),
        }
    }

    /// Upsert reverse mappings; failures only cost diagnostics
    fn record_mappings(&self, locator: &str, registry_key: &str, slot: &RulesetSlot) {
        let registries = self.registry_mappings();
        if let Err(e) = registries.add_mapping(RegistryMapping::new(registry_key, self.kind, locator)) {
            tracing::warn!("Failed to record registry mapping for {}: {}", locator, e);
        }

        let rulesets = self.ruleset_mappings();
        let mapping = RulesetMapping::new(
            &slot.key,
            registry_key,
            self.kind,
            &slot.name,
            &slot.patterns,
        );
        if let Err(e) = rulesets.add_mapping(mapping) {
            tracing::warn!("Failed to record ruleset mapping for {}: {}", slot.name, e);
        }
    }

    fn registry_mappings(&self) -> RegistryMappingStore {
        RegistryMappingStore::new(self.layout.registry_map_path())
            .with_lock_timeout(self.options.lock_timeout)
    }

    fn ruleset_mappings(&self) -> RulesetMappingStore {
        RulesetMappingStore::new(self.layout.ruleset_map_path())
            .with_lock_timeout(self.options.lock_timeout)
    }
}

fn skipped(e: CacheError) -> AccessRefresh {
    tracing::debug!("Skipping access time refresh: {}", e);
    AccessRefresh::Skipped {
        reason: e.to_string(),
    }
}

fn write_files(version_dir: &Path, files: &RulesetFiles) -> Result<()> {
    std::fs::create_dir_all(version_dir).map_err(|e| CacheError::io(version_dir, e))?;

    for (relative, content) in files {
        let target = version_dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        std::fs::write(&target, content).map_err(|e| CacheError::io(&target, e))?;
    }
    Ok(())
}

fn read_files(version_dir: &Path) -> Result<RulesetFiles> {
    let mut files = RulesetFiles::new();

    for entry in walkdir::WalkDir::new(version_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(version_dir).to_path_buf();
            CacheError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(version_dir)
            .map_err(|_| {
                CacheError::InvalidInput(format!(
                    "{} is outside {}",
                    entry.path().display(),
                    version_dir.display()
                ))
            })?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let content = std::fs::read(entry.path()).map_err(|e| CacheError::io(entry.path(), e))?;
        files.insert(relative, content);
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::ruleset_key;
    use tempfile::TempDir;

    fn slot(name: &str) -> RulesetSlot {
        RulesetSlot {
            key: ruleset_key(name),
            label: RulesetLabel::Name(name.to_string()),
            name: name.to_string(),
            patterns: Vec::new(),
        }
    }

    fn files(entries: &[(&str, &str)]) -> RulesetFiles {
        entries
            .iter()
            .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_write_and_read_files_preserve_nesting() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("v1");
        let input = files(&[("a.md", "A"), ("nested/deep/b.yaml", "B")]);

        write_files(&dir, &input).unwrap();
        assert_eq!(read_files(&dir).unwrap(), input);
    }

    #[test]
    fn test_store_rejects_unsafe_input() {
        let temp_dir = TempDir::new().unwrap();
        let store = VersionStore::new(RegistryKind::Https, CacheOptions::new(temp_dir.path()));

        let err = store
            .store("https://example.com", &slot("r"), "../up", &files(&[("a", "a")]))
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidInput(_)));

        let err = store
            .store("https://example.com", &slot("r"), "1.0.0", &files(&[("../a", "a")]))
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidInput(_)));
        assert!(!temp_dir.path().join("registries").exists());
    }

    #[test]
    fn test_get_untracked_version_skips_refresh() {
        let temp_dir = TempDir::new().unwrap();
        let store = VersionStore::new(RegistryKind::Local, CacheOptions::new(temp_dir.path()));
        let slot = slot("local-rules");

        let dir = store.version_path("/srv/rules", &slot.key, "1.0.0").unwrap();
        write_files(&dir, &files(&[("x.md", "x")])).unwrap();

        let cached = store.get("/srv/rules", &slot, "1.0.0").unwrap();
        assert_eq!(cached.files.len(), 1);
        assert!(matches!(cached.access, AccessRefresh::Skipped { .. }));
    }

    #[test]
    fn test_corrupt_index_fails_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = VersionStore::new(RegistryKind::S3, CacheOptions::new(temp_dir.path()));
        let key = store.registry_key("bucket/rules");
        std::fs::create_dir_all(store.layout().registry_dir(&key)).unwrap();
        std::fs::write(store.layout().index_path(&key), "not json").unwrap();

        let err = store
            .store("bucket/rules", &slot("r"), "1.0.0", &files(&[("a", "a")]))
            .unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
        // The lock must not be left behind
        assert!(!store.layout().lock_path(&key).exists());
    }
}
