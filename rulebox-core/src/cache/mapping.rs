//! Reverse mapping stores (`registry-map.json`, `ruleset-map.json`)
//!
//! Map opaque cache keys back to the locator, type, ruleset name and patterns
//! they were derived from. The documents are conveniences for diagnostics, so
//! corruption is recovered locally: the damaged file is kept aside under a
//! timestamped name and a fresh empty document replaces it.
//!
//! Every access runs under the shared `locks/mappings.lock`, and every write
//! is a full read-modify-write of the document followed by an atomic rename.
//! Both documents are shared by all registries, so the per-registry locks do
//! not cover them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::config::DEFAULT_LOCK_TIMEOUT;
use super::fsutil::{atomic_write, now_rfc3339, write_json_atomic};
use super::keys::{is_valid_cache_key, normalize_patterns};
use super::layout::{CacheLayout, MAPPINGS_LOCK};
use super::lock::{LockManager, RegistryLock};
use super::normalize::{normalize, RegistryKind};
use crate::error::{CacheError, Result};

/// Reverse lookup for a registry key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMapping {
    pub cache_key: String,
    pub registry_type: RegistryKind,
    /// Locator as the caller supplied it
    pub url: String,
    pub normalized_url: String,
    pub created_on: String,
    pub last_accessed_on: String,
}

/// Reverse lookup for a ruleset or patterns key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesetMapping {
    pub cache_key: String,
    pub registry_key: String,
    pub registry_type: RegistryKind,
    pub ruleset_name: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub normalized_patterns: String,
    pub created_on: String,
    pub last_accessed_on: String,
}

/// A record kept in a mapping document
pub trait MappingRecord: Serialize + DeserializeOwned + Clone {
    /// Human-readable document name for errors and logs
    const WHAT: &'static str;

    fn cache_key(&self) -> &str;

    fn created_on(&self) -> &str;

    fn set_created_on(&mut self, created_on: String);

    fn set_last_accessed_on(&mut self, accessed_on: String);

    /// Describe why the record is structurally invalid, if it is
    fn validate(&self) -> std::result::Result<(), String>;

    /// Whether `other` describes the same cache entry and should replace this record
    fn same_entry(&self, other: &Self) -> bool {
        self.cache_key() == other.cache_key()
    }
}

impl MappingRecord for RegistryMapping {
    const WHAT: &'static str = "registry mapping";

    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    fn created_on(&self) -> &str {
        &self.created_on
    }

    fn set_created_on(&mut self, created_on: String) {
        self.created_on = created_on;
    }

    fn set_last_accessed_on(&mut self, accessed_on: String) {
        self.last_accessed_on = accessed_on;
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if !is_valid_cache_key(&self.cache_key) {
            return Err(format!("invalid cache key '{}'", self.cache_key));
        }
        if self.url.trim().is_empty() || self.normalized_url.trim().is_empty() {
            return Err("empty url".to_string());
        }
        if self.created_on.is_empty() {
            return Err("missing createdOn".to_string());
        }
        Ok(())
    }
}

impl MappingRecord for RulesetMapping {
    const WHAT: &'static str = "ruleset mapping";

    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    fn created_on(&self) -> &str {
        &self.created_on
    }

    fn set_created_on(&mut self, created_on: String) {
        self.created_on = created_on;
    }

    fn set_last_accessed_on(&mut self, accessed_on: String) {
        self.last_accessed_on = accessed_on;
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if !is_valid_cache_key(&self.cache_key) {
            return Err(format!("invalid cache key '{}'", self.cache_key));
        }
        if !is_valid_cache_key(&self.registry_key) {
            return Err(format!("invalid registry key '{}'", self.registry_key));
        }
        if self.ruleset_name.trim().is_empty() {
            return Err("empty ruleset name".to_string());
        }
        if self.created_on.is_empty() {
            return Err("missing createdOn".to_string());
        }
        Ok(())
    }

    // Ruleset keys are only unique within a registry
    fn same_entry(&self, other: &Self) -> bool {
        self.cache_key == other.cache_key && self.registry_key == other.registry_key
    }
}

impl RegistryMapping {
    pub fn new(cache_key: &str, registry_type: RegistryKind, url: &str) -> Self {
        let now = now_rfc3339();
        Self {
            cache_key: cache_key.to_string(),
            registry_type,
            url: url.to_string(),
            normalized_url: normalize(registry_type, url),
            created_on: now.clone(),
            last_accessed_on: now,
        }
    }
}

impl RulesetMapping {
    pub fn new(
        cache_key: &str,
        registry_key: &str,
        registry_type: RegistryKind,
        ruleset_name: &str,
        patterns: &[String],
    ) -> Self {
        let now = now_rfc3339();
        Self {
            cache_key: cache_key.to_string(),
            registry_key: registry_key.to_string(),
            registry_type,
            ruleset_name: ruleset_name.to_string(),
            patterns: patterns.to_vec(),
            normalized_patterns: normalize_patterns(patterns),
            created_on: now.clone(),
            last_accessed_on: now,
        }
    }
}

/// What `validate_and_recover` found and did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Records remaining after validation
    pub valid: usize,
    /// Structurally invalid records that were dropped
    pub dropped: usize,
    /// Where an unparsable document was moved, if one was
    pub backup_path: Option<PathBuf>,
}

/// One JSON mapping document on disk
///
/// The document is expected directly under the cache root; its lock lives in
/// the sibling `locks/` directory.
#[derive(Debug, Clone)]
pub struct MappingStore<T> {
    path: PathBuf,
    locks: LockManager,
    lock_timeout: Duration,
    _record: PhantomData<T>,
}

pub type RegistryMappingStore = MappingStore<RegistryMapping>;
pub type RulesetMappingStore = MappingStore<RulesetMapping>;

impl<T: MappingRecord> MappingStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self {
            path,
            locks: LockManager::new(CacheLayout::new(root)),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            _record: PhantomData,
        }
    }

    /// How long to wait for the mappings lock before failing with `LockTimeout`
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, repairing it if needed
    ///
    /// Unparsable documents are renamed aside with a unix-timestamp suffix and
    /// replaced by an empty one. Invalid records are dropped, and the document
    /// is rewritten only if any were.
    pub fn validate_and_recover(&self) -> Result<RecoveryReport> {
        let _lock = self.lock("repair")?;
        self.load_recovered().map(|(_, report)| report)
    }

    /// All valid records in the document
    pub fn mappings(&self) -> Result<Vec<T>> {
        let _lock = self.lock("read")?;
        self.load_recovered().map(|(records, _)| records)
    }

    /// Upsert by cache key, keeping the original creation time of an existing record
    pub fn add_mapping(&self, mut record: T) -> Result<()> {
        record.validate().map_err(|reason| {
            CacheError::InvalidInput(format!("refusing to store {}: {reason}", T::WHAT))
        })?;

        let _lock = self.lock("add")?;
        let (mut records, _) = self.load_recovered()?;
        match records
            .iter_mut()
            .find(|existing| existing.same_entry(&record))
        {
            Some(existing) => {
                record.set_created_on(existing.created_on().to_string());
                *existing = record;
            }
            None => records.push(record),
        }

        self.save(&records)
    }

    /// Remove every record matching `predicate`; returns how many were removed
    pub fn remove_where(&self, predicate: impl Fn(&T) -> bool) -> Result<usize> {
        let _lock = self.lock("remove")?;
        let (records, _) = self.load_recovered()?;
        let before = records.len();
        let kept: Vec<T> = records.into_iter().filter(|r| !predicate(r)).collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.save(&kept)?;
        }
        Ok(removed)
    }

    /// Set `lastAccessedOn` on every record matching `predicate`; returns how many matched
    pub fn touch(&self, predicate: impl Fn(&T) -> bool, accessed_on: &str) -> Result<usize> {
        let _lock = self.lock("access")?;
        let (mut records, _) = self.load_recovered()?;
        let mut touched = 0;
        for record in records.iter_mut().filter(|r| predicate(r)) {
            record.set_last_accessed_on(accessed_on.to_string());
            touched += 1;
        }
        if touched > 0 {
            self.save(&records)?;
        }
        Ok(touched)
    }

    fn find(&self, predicate: impl Fn(&T) -> bool) -> Result<Option<T>> {
        Ok(self.mappings()?.into_iter().find(|r| predicate(r)))
    }

    /// Held for the lifetime of the returned handle
    fn lock(&self, operation: &str) -> Result<RegistryLock> {
        let mut lock = self.locks.lock(MAPPINGS_LOCK);
        lock.acquire(operation, self.lock_timeout)?;
        Ok(lock)
    }

    fn save(&self, records: &[T]) -> Result<()> {
        write_json_atomic(&self.path, &records, T::WHAT)
    }

    fn load_recovered(&self) -> Result<(Vec<T>, RecoveryReport)> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), RecoveryReport::default()));
            }
            Err(e) => return Err(CacheError::io(&self.path, e)),
        };

        let raw: Vec<serde_json::Value> = match serde_json::from_slice(&content) {
            Ok(raw) => raw,
            Err(e) => {
                let backup_path = self.quarantine(&e)?;
                return Ok((
                    Vec::new(),
                    RecoveryReport {
                        valid: 0,
                        dropped: 0,
                        backup_path: Some(backup_path),
                    },
                ));
            }
        };

        let total = raw.len();
        let records: Vec<T> = raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<T>(value) {
                Ok(record) => match record.validate() {
                    Ok(()) => Some(record),
                    Err(reason) => {
                        tracing::debug!("Dropping invalid {}: {}", T::WHAT, reason);
                        None
                    }
                },
                Err(e) => {
                    tracing::debug!("Dropping malformed {}: {}", T::WHAT, e);
                    None
                }
            })
            .collect();

        let dropped = total - records.len();
        if dropped > 0 {
            tracing::info!(
                "Removed {} invalid record(s) from {}",
                dropped,
                self.path.display()
            );
            self.save(&records)?;
        }

        let report = RecoveryReport {
            valid: records.len(),
            dropped,
            backup_path: None,
        };
        Ok((records, report))
    }

    /// Move an unparsable document aside and start a fresh empty one
    fn quarantine(&self, parse_error: &serde_json::Error) -> Result<PathBuf> {
        let timestamp = chrono::Utc::now().timestamp();
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "mapping.json".to_string());

        let mut backup_path = self.path.with_file_name(format!("{file_name}.corrupt.{timestamp}"));
        let mut attempt = 1;
        while backup_path.exists() {
            backup_path = self
                .path
                .with_file_name(format!("{file_name}.corrupt.{timestamp}.{attempt}"));
            attempt += 1;
        }

        std::fs::rename(&self.path, &backup_path).map_err(|e| CacheError::io(&self.path, e))?;
        atomic_write(&self.path, b"[]")?;

        tracing::warn!(
            "{} at {} was corrupted ({}); preserved as {} and started a fresh document",
            T::WHAT,
            self.path.display(),
            parse_error,
            backup_path.display()
        );
        Ok(backup_path)
    }
}

impl MappingStore<RegistryMapping> {
    /// Find the mapping for a locator, normalizing it the same way keys are derived
    pub fn find_mapping_by_url(
        &self,
        registry_type: RegistryKind,
        url: &str,
    ) -> Result<Option<RegistryMapping>> {
        let normalized = normalize(registry_type, url);
        self.find(|m| m.registry_type == registry_type && m.normalized_url == normalized)
    }
}

impl MappingStore<RulesetMapping> {
    /// Find the mapping for a ruleset name and pattern selection within a registry
    pub fn find_mapping_by_ruleset(
        &self,
        registry_key: &str,
        ruleset_name: &str,
        patterns: &[String],
    ) -> Result<Option<RulesetMapping>> {
        let normalized = normalize_patterns(patterns);
        let name = ruleset_name.trim();
        self.find(|m| {
            m.registry_key == registry_key
                && m.ruleset_name.trim() == name
                && m.normalized_patterns == normalized
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::{hash_string, registry_key, ruleset_key};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn registry_store(dir: &TempDir) -> RegistryMappingStore {
        MappingStore::new(dir.path().join("registry-map.json"))
    }

    #[test]
    fn test_missing_document_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = registry_store(&temp_dir);
        assert!(store.mappings().unwrap().is_empty());
        assert_eq!(store.validate_and_recover().unwrap(), RecoveryReport::default());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_add_mapping_upserts_and_keeps_created_on() {
        let temp_dir = TempDir::new().unwrap();
        let store = registry_store(&temp_dir);
        let key = registry_key(RegistryKind::Git, "https://github.com/u/r");

        let mut first = RegistryMapping::new(&key, RegistryKind::Git, "https://github.com/u/r");
        first.created_on = "2026-01-01T00:00:00+00:00".to_string();
        store.add_mapping(first).unwrap();

        let second = RegistryMapping::new(&key, RegistryKind::Git, "git@github.com:u/r.git");
        store.add_mapping(second).unwrap();

        let mappings = store.mappings().unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].created_on, "2026-01-01T00:00:00+00:00");
        assert_eq!(mappings[0].url, "git@github.com:u/r.git");
    }

    #[test]
    fn test_find_mapping_by_url_uses_normalized_form() {
        let temp_dir = TempDir::new().unwrap();
        let store = registry_store(&temp_dir);
        let key = registry_key(RegistryKind::Git, "git@github.com:u/r.git");
        store
            .add_mapping(RegistryMapping::new(&key, RegistryKind::Git, "git@github.com:u/r.git"))
            .unwrap();

        let found = store
            .find_mapping_by_url(RegistryKind::Git, "https://github.com/u/r")
            .unwrap()
            .unwrap();
        assert_eq!(found.cache_key, key);
        assert!(store
            .find_mapping_by_url(RegistryKind::Https, "https://github.com/u/r")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_find_mapping_by_ruleset() {
        let temp_dir = TempDir::new().unwrap();
        let store: RulesetMappingStore = MappingStore::new(temp_dir.path().join("ruleset-map.json"));
        let reg = registry_key(RegistryKind::S3, "bucket/rules");
        let patterns = vec!["b.md".to_string(), "a.md".to_string()];
        store
            .add_mapping(RulesetMapping::new(
                &ruleset_key("team"),
                &reg,
                RegistryKind::S3,
                "team",
                &patterns,
            ))
            .unwrap();

        let reordered = vec![" a.md".to_string(), "b.md ".to_string()];
        assert!(store
            .find_mapping_by_ruleset(&reg, "team", &reordered)
            .unwrap()
            .is_some());
        assert!(store
            .find_mapping_by_ruleset(&reg, "other", &reordered)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_same_ruleset_in_two_registries_kept_apart() {
        let temp_dir = TempDir::new().unwrap();
        let store: RulesetMappingStore = MappingStore::new(temp_dir.path().join("ruleset-map.json"));
        let first = registry_key(RegistryKind::Https, "https://a.example.com");
        let second = registry_key(RegistryKind::Https, "https://b.example.com");

        for reg in [&first, &second] {
            store
                .add_mapping(RulesetMapping::new(
                    &ruleset_key("baseline"),
                    reg,
                    RegistryKind::Https,
                    "baseline",
                    &[],
                ))
                .unwrap();
        }

        assert_eq!(store.mappings().unwrap().len(), 2);
        assert!(store
            .find_mapping_by_ruleset(&first, "baseline", &[])
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_invalid_json_is_quarantined() {
        let temp_dir = TempDir::new().unwrap();
        let store = registry_store(&temp_dir);
        std::fs::write(store.path(), b"[{\"cacheKey\": ").unwrap();

        let report = store.validate_and_recover().unwrap();
        let backup = report.backup_path.expect("backup path");
        assert_eq!(std::fs::read(&backup).unwrap(), b"[{\"cacheKey\": ");
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("registry-map.json.corrupt."));

        assert!(store.mappings().unwrap().is_empty());
        let fresh: Vec<serde_json::Value> =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_invalid_records_are_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let store = registry_store(&temp_dir);
        let good_key = hash_string("git:https://github.com/u/r");

        let document = serde_json::json!([
            {
                "cacheKey": good_key,
                "registryType": "git",
                "url": "https://github.com/u/r",
                "normalizedUrl": "https://github.com/u/r",
                "createdOn": "2026-01-01T00:00:00+00:00",
                "lastAccessedOn": "2026-01-01T00:00:00+00:00"
            },
            {
                "cacheKey": "tooshort",
                "registryType": "git",
                "url": "https://github.com/u/x",
                "normalizedUrl": "https://github.com/u/x",
                "createdOn": "2026-01-01T00:00:00+00:00",
                "lastAccessedOn": "2026-01-01T00:00:00+00:00"
            },
            {
                "cacheKey": hash_string("svn:x"),
                "registryType": "svn",
                "url": "svn://x",
                "normalizedUrl": "svn://x",
                "createdOn": "2026-01-01T00:00:00+00:00",
                "lastAccessedOn": "2026-01-01T00:00:00+00:00"
            }
        ]);
        std::fs::write(store.path(), serde_json::to_vec(&document).unwrap()).unwrap();

        let report = store.validate_and_recover().unwrap();
        assert_eq!(report.valid, 1);
        assert_eq!(report.dropped, 2);
        assert!(report.backup_path.is_none());

        // Rewritten on disk, so a second pass has nothing to drop
        let again = store.validate_and_recover().unwrap();
        assert_eq!(again.dropped, 0);
        assert_eq!(store.mappings().unwrap()[0].cache_key, good_key);
    }

    #[test]
    fn test_add_mapping_rejects_invalid_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = registry_store(&temp_dir);
        let bad = RegistryMapping::new("nothex", RegistryKind::Https, "https://example.com");
        assert!(matches!(
            store.add_mapping(bad),
            Err(CacheError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_remove_where() {
        let temp_dir = TempDir::new().unwrap();
        let store = registry_store(&temp_dir);
        for url in ["https://a.example.com", "https://b.example.com"] {
            let key = registry_key(RegistryKind::Https, url);
            store
                .add_mapping(RegistryMapping::new(&key, RegistryKind::Https, url))
                .unwrap();
        }

        let removed = store
            .remove_where(|m| m.normalized_url.contains("a.example"))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.mappings().unwrap().len(), 1);
        assert_eq!(store.remove_where(|_| false).unwrap(), 0);
    }

    #[test]
    fn test_touch_updates_only_matching_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = registry_store(&temp_dir);
        let old = "2026-01-01T00:00:00+00:00";
        for url in ["https://a.example.com", "https://b.example.com"] {
            let mut mapping =
                RegistryMapping::new(&registry_key(RegistryKind::Https, url), RegistryKind::Https, url);
            mapping.created_on = old.to_string();
            mapping.last_accessed_on = old.to_string();
            store.add_mapping(mapping).unwrap();
        }

        let target = registry_key(RegistryKind::Https, "https://a.example.com");
        let now = now_rfc3339();
        assert_eq!(store.touch(|m| m.cache_key == target, &now).unwrap(), 1);
        assert_eq!(store.touch(|_| false, &now).unwrap(), 0);

        for mapping in store.mappings().unwrap() {
            let expected = if mapping.cache_key == target { now.as_str() } else { old };
            assert_eq!(mapping.last_accessed_on, expected);
            assert_eq!(mapping.created_on, old);
        }
    }

    #[test]
    fn test_writes_wait_for_mappings_lock() {
        let temp_dir = TempDir::new().unwrap();
        let store = registry_store(&temp_dir).with_lock_timeout(Duration::from_millis(200));
        let key = registry_key(RegistryKind::Https, "https://a.example.com");
        let mapping = RegistryMapping::new(&key, RegistryKind::Https, "https://a.example.com");

        let mut holder = LockManager::new(CacheLayout::new(temp_dir.path())).lock(MAPPINGS_LOCK);
        holder.acquire("repair", Duration::from_secs(1)).unwrap();
        let err = store.add_mapping(mapping.clone()).unwrap_err();
        assert!(err.is_lock_timeout());
        assert!(!store.path().exists());

        holder.release().unwrap();
        store.add_mapping(mapping).unwrap();
        assert_eq!(store.mappings().unwrap().len(), 1);
    }
}
