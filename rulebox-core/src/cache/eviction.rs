//! TTL and size-based eviction over the whole cache root
//!
//! Both sweeps are best-effort under concurrent eviction from other
//! processes: anything that has already been deleted counts as removed.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::config::{CacheConfig, CacheOptions};
use super::fsutil::{dir_size, is_expired, list_subdirs, remove_dir_all_tolerant};
use super::index::RegistryIndex;
use super::layout::CacheLayout;
use super::lock::LockManager;
use super::mapping::{RegistryMappingStore, RulesetMappingStore};
use crate::error::Result;

/// What a TTL sweep removed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TtlCleanupReport {
    pub registries_scanned: usize,
    pub removed_rulesets: usize,
    pub removed_versions: usize,
    /// Ruleset directories on disk that the index did not know about
    pub removed_untracked: usize,
    /// Registries whose sweep failed, with the reason
    pub failed_registries: Vec<(String, String)>,
}

/// What a size sweep removed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SizeCleanupReport {
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub removed_versions: usize,
    pub pruned_mappings: usize,
}

/// Result of `run_maintenance`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    /// True when cleanup is disabled in `config.json`
    pub skipped: bool,
    pub ttl: TtlCleanupReport,
    pub size: SizeCleanupReport,
    pub pruned_mappings: usize,
}

/// Totals for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_size_bytes: u64,
    pub total_size_mb: f64,
    pub registry_count: usize,
}

/// A version directory considered by the size sweep
#[derive(Debug)]
struct VersionCandidate {
    registry_key: String,
    ruleset_key: String,
    version: String,
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct RegistrySweep {
    removed_rulesets: usize,
    removed_versions: usize,
    removed_untracked: usize,
}

/// Runs eviction sweeps over one cache root
#[derive(Debug, Clone)]
pub struct Evictor {
    options: CacheOptions,
    layout: CacheLayout,
    locks: LockManager,
}

impl Evictor {
    pub fn new(options: &CacheOptions) -> Self {
        let layout = CacheLayout::new(options.root.clone());
        Self {
            options: options.clone(),
            locks: LockManager::new(layout.clone()),
            layout,
        }
    }

    /// Remove rulesets and versions not accessed within `ttl`
    ///
    /// A zero TTL disables the sweep. A failure on one registry is recorded in
    /// the report and the sweep moves on to the next.
    pub fn cleanup_by_ttl(&self, ttl: Duration) -> Result<TtlCleanupReport> {
        let mut report = TtlCleanupReport::default();
        if ttl.is_zero() {
            return Ok(report);
        }

        for registry_key in list_subdirs(&self.layout.registries_dir())? {
            if !self.layout.index_path(&registry_key).is_file() {
                tracing::debug!("Skipping registry {} without an index", registry_key);
                continue;
            }
            report.registries_scanned += 1;

            match self.sweep_registry_ttl(&registry_key, ttl) {
                Ok(sweep) => {
                    report.removed_rulesets += sweep.removed_rulesets;
                    report.removed_versions += sweep.removed_versions;
                    report.removed_untracked += sweep.removed_untracked;
                }
                Err(e) => {
                    tracing::warn!("TTL cleanup failed for registry {}: {}", registry_key, e);
                    report.failed_registries.push((registry_key, e.to_string()));
                }
            }
        }

        if report.removed_rulesets + report.removed_versions + report.removed_untracked > 0 {
            tracing::info!(
                "TTL cleanup removed {} rulesets, {} versions and {} untracked directories",
                report.removed_rulesets,
                report.removed_versions,
                report.removed_untracked
            );
        }
        Ok(report)
    }

    fn sweep_registry_ttl(&self, registry_key: &str, ttl: Duration) -> Result<RegistrySweep> {
        let mut lock = self.locks.lock(registry_key);
        lock.acquire("cleanup", self.options.lock_timeout)?;

        let mut index = RegistryIndex::load(&self.layout, registry_key)?;
        let now = Utc::now();
        let mut sweep = RegistrySweep::default();

        let ruleset_keys: Vec<String> = index.rulesets.keys().cloned().collect();
        for ruleset_key in ruleset_keys {
            let ruleset_dir = self.layout.ruleset_dir(registry_key, &ruleset_key);
            let Some(entry) = index.rulesets.get_mut(&ruleset_key) else {
                continue;
            };

            if is_expired(&entry.last_accessed_on, ttl, now) {
                remove_dir_all_tolerant(&ruleset_dir)?;
                sweep.removed_versions += entry.versions.len();
                sweep.removed_rulesets += 1;
                index.rulesets.remove(&ruleset_key);
                tracing::debug!("Evicted expired ruleset {}/{}", registry_key, ruleset_key);
                continue;
            }

            let expired: Vec<String> = entry
                .versions
                .iter()
                .filter(|(_, v)| is_expired(&v.last_accessed_on, ttl, now))
                .map(|(version, _)| version.clone())
                .collect();
            for version in expired {
                remove_dir_all_tolerant(&ruleset_dir.join(&version))?;
                entry.versions.remove(&version);
                sweep.removed_versions += 1;
                tracing::debug!(
                    "Evicted expired version {}/{}/{}",
                    registry_key,
                    ruleset_key,
                    version
                );
            }

            if entry.versions.is_empty() {
                remove_dir_all_tolerant(&ruleset_dir)?;
                index.rulesets.remove(&ruleset_key);
                sweep.removed_rulesets += 1;
            }
        }

        // Untracked directories younger than the TTL may belong to a store in flight
        let now_system = SystemTime::now();
        for ruleset_key in list_subdirs(&self.layout.rulesets_dir(registry_key))? {
            if index.rulesets.contains_key(&ruleset_key) {
                continue;
            }
            let dir = self.layout.ruleset_dir(registry_key, &ruleset_key);
            if modified_age(&dir, now_system).is_some_and(|age| age >= ttl) {
                remove_dir_all_tolerant(&dir)?;
                sweep.removed_untracked += 1;
                tracing::debug!("Removed untracked ruleset directory {}", dir.display());
            }
        }

        if sweep.removed_rulesets + sweep.removed_versions > 0 {
            index.last_updated_on = now.to_rfc3339();
            index.save(&self.layout, registry_key)?;
        }

        lock.release()?;
        Ok(sweep)
    }

    /// Delete the least recently modified version directories until the
    /// registries tree is at or below `max_bytes`
    pub fn cleanup_by_size(&self, max_bytes: u64) -> Result<SizeCleanupReport> {
        let registries_dir = self.layout.registries_dir();
        let bytes_before = dir_size(&registries_dir);
        let mut report = SizeCleanupReport {
            bytes_before,
            bytes_after: bytes_before,
            ..Default::default()
        };
        if bytes_before <= max_bytes {
            return Ok(report);
        }

        let mut candidates = self.version_candidates()?;
        candidates.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

        let mut total = bytes_before;
        let mut removed: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for candidate in candidates {
            if total <= max_bytes {
                break;
            }
            if let Err(e) = remove_dir_all_tolerant(&candidate.path) {
                tracing::warn!("Failed to evict {}: {}", candidate.path.display(), e);
                continue;
            }
            total = total.saturating_sub(candidate.size);
            report.removed_versions += 1;
            tracing::debug!(
                "Evicted {} ({} bytes) to fit the size budget",
                candidate.path.display(),
                candidate.size
            );

            // Only succeeds once the ruleset directory has no versions left
            let _ = std::fs::remove_dir(self.layout.ruleset_dir(
                &candidate.registry_key,
                &candidate.ruleset_key,
            ));

            removed
                .entry(candidate.registry_key)
                .or_default()
                .push((candidate.ruleset_key, candidate.version));
        }

        for (registry_key, versions) in &removed {
            self.forget_versions(registry_key, versions);
        }

        if report.removed_versions > 0 {
            report.pruned_mappings = self.prune_orphaned_mappings()?;
        }
        report.bytes_after = dir_size(&registries_dir);

        tracing::info!(
            "Size cleanup removed {} versions ({} -> {} bytes, budget {})",
            report.removed_versions,
            report.bytes_before,
            report.bytes_after,
            max_bytes
        );
        Ok(report)
    }

    fn version_candidates(&self) -> Result<Vec<VersionCandidate>> {
        let mut candidates = Vec::new();
        for registry_key in list_subdirs(&self.layout.registries_dir())? {
            for ruleset_key in list_subdirs(&self.layout.rulesets_dir(&registry_key))? {
                let ruleset_dir = self.layout.ruleset_dir(&registry_key, &ruleset_key);
                for version in list_subdirs(&ruleset_dir)? {
                    let path = ruleset_dir.join(&version);
                    let modified = std::fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    candidates.push(VersionCandidate {
                        registry_key: registry_key.clone(),
                        ruleset_key: ruleset_key.clone(),
                        version,
                        size: dir_size(&path),
                        path,
                        modified,
                    });
                }
            }
        }
        Ok(candidates)
    }

    /// Drop evicted versions from a registry index; failures are only logged
    fn forget_versions(&self, registry_key: &str, versions: &[(String, String)]) {
        let mut lock = self.locks.lock(registry_key);
        if let Err(e) = lock.acquire("cleanup", self.options.lock_timeout) {
            tracing::warn!("Could not update index for registry {}: {}", registry_key, e);
            return;
        }

        let mut index = match RegistryIndex::load(&self.layout, registry_key) {
            Ok(index) => index,
            Err(e) => {
                if !e.is_not_found() {
                    tracing::warn!("Could not update index for registry {}: {}", registry_key, e);
                }
                return;
            }
        };

        for (ruleset_key, version) in versions {
            index.remove_version(ruleset_key, version);
        }
        index.last_updated_on = Utc::now().to_rfc3339();

        if let Err(e) = index.save(&self.layout, registry_key) {
            tracing::warn!("Could not update index for registry {}: {}", registry_key, e);
        }
        if let Err(e) = lock.release() {
            tracing::warn!("Failed to release lock for registry {}: {}", registry_key, e);
        }
    }

    /// Remove mapping records whose cache directories no longer exist
    pub fn prune_orphaned_mappings(&self) -> Result<usize> {
        let rulesets = RulesetMappingStore::new(self.layout.ruleset_map_path());
        let pruned_rulesets = rulesets.remove_where(|m| {
            !self
                .layout
                .ruleset_dir(&m.registry_key, &m.cache_key)
                .is_dir()
        })?;

        let registries = RegistryMappingStore::new(self.layout.registry_map_path());
        let pruned_registries =
            registries.remove_where(|m| !self.layout.registry_dir(&m.cache_key).is_dir())?;

        let pruned = pruned_rulesets + pruned_registries;
        if pruned > 0 {
            tracing::info!("Pruned {} orphaned mapping records", pruned);
        }
        Ok(pruned)
    }
}

/// Run the configured sweeps: TTL, then size, then orphan mappings
pub fn run_maintenance(options: &CacheOptions, config: &CacheConfig) -> Result<MaintenanceReport> {
    if !config.cleanup_enabled {
        tracing::debug!("Cache cleanup is disabled; skipping maintenance");
        return Ok(MaintenanceReport {
            skipped: true,
            ..Default::default()
        });
    }

    let evictor = Evictor::new(options);
    let ttl = evictor.cleanup_by_ttl(config.ttl())?;
    let size = evictor.cleanup_by_size(config.max_size_bytes())?;
    let pruned_mappings = evictor.prune_orphaned_mappings()?;

    Ok(MaintenanceReport {
        skipped: false,
        ttl,
        size,
        pruned_mappings,
    })
}

/// Size and registry count for a cache root; a missing root is empty
pub fn get_cache_stats(root: &Path) -> Result<CacheStats> {
    let layout = CacheLayout::new(root);
    let total_size_bytes = dir_size(root);
    let registry_count = list_subdirs(&layout.registries_dir())?.len();

    Ok(CacheStats {
        total_size_bytes,
        total_size_mb: total_size_bytes as f64 / (1024.0 * 1024.0),
        registry_count,
    })
}

fn modified_age(path: &Path, now: SystemTime) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(now.duration_since(modified).unwrap_or_default())
}
