//! Rulebox registry cache
//!
//! A durable, content-addressed cache that sits between registry clients and
//! the installer. Several tool invocations may share one cache root at the
//! same time; per-registry advisory locks serialize the index updates and a
//! single `mappings` lock serializes writes to the two mapping documents.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!     ├── config.json          ← TTL, size budget, cleanup switch
//!     ├── registry-map.json    ← registry key → original locator
//!     ├── ruleset-map.json     ← ruleset key → name and patterns
//!     ├── locks/{key}.lock     ← one per registry, plus mappings.lock
//!     └── registries/{registryKey}/
//!             ├── index.json
//!             ├── repository/  ← persistent clone (Git only)
//!             └── rulesets/{rulesetKey}/{version}/**
//! ```
//!
//! Registry keys are SHA-256 digests of the type-qualified normalized
//! locator. Ruleset keys hash the ruleset name, or the sorted pattern set for
//! Git registries.

mod config;
mod eviction;
mod fsutil;
mod git;
mod index;
mod keys;
mod layout;
mod lock;
mod manager;
mod mapping;
mod normalize;
mod ruleset;
mod store;

pub use config::{
    CacheConfig, CacheOptions, CONFIG_FILE, DEFAULT_ACCESS_REFRESH_TIMEOUT, DEFAULT_LOCK_TIMEOUT,
    DEFAULT_MAX_SIZE_MB, DEFAULT_TTL_HOURS,
};
pub use eviction::{
    get_cache_stats, run_maintenance, CacheStats, Evictor, MaintenanceReport, SizeCleanupReport,
    TtlCleanupReport,
};
pub use git::GitRegistryCache;
pub use index::{RegistryIndex, RulesetCacheEntry, RulesetLabel, VersionCacheEntry};
pub use keys::{
    hash_string, is_valid_cache_key, normalize_patterns, patterns_key, registry_key, ruleset_key,
};
pub use layout::{CacheLayout, MAPPINGS_LOCK};
pub use lock::{
    inspect_lock, LockInfo, LockManager, LockState, RegistryLock, LOCK_POLL_INTERVAL, STALE_LOCK_AGE,
};
pub use manager::{CleanupReport, RegistryCache};
pub use mapping::{
    MappingRecord, MappingStore, RecoveryReport, RegistryMapping, RegistryMappingStore,
    RulesetMapping, RulesetMappingStore,
};
pub use normalize::{normalize, normalize_raw, RegistryKind};
pub use ruleset::RulesetRegistryCache;
pub use store::{AccessRefresh, CachedRuleset, RulesetFiles, RulesetRef};
