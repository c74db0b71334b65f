//! End-to-end behaviour of the registry cache against a real temp directory

use chrono::{Duration as ChronoDuration, Utc};
use filetime::FileTime;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tempfile::TempDir;

use rulebox_core::cache::{
    get_cache_stats, patterns_key, registry_key, run_maintenance, ruleset_key, AccessRefresh,
    CacheConfig, CacheLayout, CacheOptions, Evictor, RegistryCache, RegistryIndex, RegistryKind,
    RegistryMappingStore, RulesetFiles, RulesetMappingStore, RulesetRef,
};

const REPO: &str = "https://github.com/user/repo";

fn files(entries: &[(&str, &str)]) -> RulesetFiles {
    entries
        .iter()
        .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
        .collect()
}

fn hours_ago(hours: i64) -> String {
    (Utc::now() - ChronoDuration::hours(hours)).to_rfc3339()
}

#[test]
fn test_equivalent_locators_share_registry_key() {
    let pairs = [
        (RegistryKind::Git, "git@github.com:u/r.git", "https://github.com/u/r"),
        (RegistryKind::Git, "ssh://git@github.com/u/r", "github.com/u/r/"),
        (RegistryKind::S3, "s3://bucket/rules/", "bucket//rules"),
        (
            RegistryKind::Https,
            "HTTPS://Rules.Example.com/packs/",
            "https://rules.example.com/packs",
        ),
        (RegistryKind::Local, "/opt/rules/./team/..", "file:///opt/rules"),
    ];

    for (kind, a, b) in pairs {
        assert_eq!(registry_key(kind, a), registry_key(kind, b), "{kind}: {a} vs {b}");
    }
    assert_ne!(
        registry_key(RegistryKind::Git, REPO),
        registry_key(RegistryKind::Https, REPO)
    );
}

#[test]
fn test_patterns_key_is_order_and_whitespace_insensitive() {
    let a = vec!["rules/*.md".to_string(), "docs/**".to_string()];
    let b = vec![" docs/**".to_string(), "rules/*.md  ".to_string()];
    assert_eq!(patterns_key(&a), patterns_key(&b));
    assert_ne!(patterns_key(&a), patterns_key(&a[..1]));
}

#[test]
fn test_round_trip_for_every_registry_kind() {
    let temp_dir = TempDir::new().unwrap();
    let mut payload = files(&[
        ("README.md", "# Rules\n"),
        ("policies/deny.rego", "package deny\n"),
    ]);
    payload.insert("bin/blob".to_string(), vec![0u8, 159, 146, 150, 255]);

    let locators = [
        (RegistryKind::Git, REPO),
        (RegistryKind::GitLab, "https://gitlab.com/group/rules"),
        (RegistryKind::S3, "s3://team-bucket/rules"),
        (RegistryKind::Https, "https://rules.example.com/packs"),
        (RegistryKind::Local, "/srv/rules"),
    ];

    for (kind, locator) in locators {
        let cache = RegistryCache::new(kind, CacheOptions::new(temp_dir.path()));
        let ruleset = RulesetRef::with_patterns("team-rules", &["**/*"]);

        let stored_at = cache.store(locator, &ruleset, "1.2.3", &payload).unwrap();
        assert_eq!(stored_at, cache.get_path(locator, &ruleset, "1.2.3").unwrap());

        let cached = cache.get(locator, &ruleset, "1.2.3").unwrap();
        assert_eq!(cached.files, payload, "{kind}");
        assert_eq!(cached.access, AccessRefresh::Recorded);
    }

    assert_eq!(get_cache_stats(temp_dir.path()).unwrap().registry_count, 5);
}

#[test]
fn test_missing_version_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let cache = RegistryCache::new(RegistryKind::Https, CacheOptions::new(temp_dir.path()));
    let err = cache
        .get("https://rules.example.com", &RulesetRef::named("absent"), "1.0.0")
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_is_valid_follows_last_access() {
    let temp_dir = TempDir::new().unwrap();
    let layout = CacheLayout::new(temp_dir.path());
    let cache = RegistryCache::new(RegistryKind::S3, CacheOptions::new(temp_dir.path()));
    let locator = "s3://team-bucket/rules";
    cache
        .store(locator, &RulesetRef::named("base"), "1.0.0", &files(&[("a", "a")]))
        .unwrap();

    let one_hour = Duration::from_secs(3600);
    assert!(cache.is_valid(locator, one_hour));

    // Simulate two hours without access
    let key = registry_key(RegistryKind::S3, locator);
    let mut index = RegistryIndex::load(&layout, &key).unwrap();
    index.last_accessed_on = hours_ago(2);
    index.save(&layout, &key).unwrap();

    assert!(!cache.is_valid(locator, one_hour));
    assert!(cache.is_valid(locator, Duration::ZERO));

    // A read refreshes the registry's access time
    cache.get(locator, &RulesetRef::named("base"), "1.0.0").unwrap();
    assert!(cache.is_valid(locator, one_hour));
}

#[test]
fn test_ttl_cleanup_scenario_keeps_newer_version() {
    let temp_dir = TempDir::new().unwrap();
    let options = CacheOptions::new(temp_dir.path());
    let layout = CacheLayout::new(temp_dir.path());
    let cache = RegistryCache::new(RegistryKind::Git, options.clone());
    let ruleset = RulesetRef::with_patterns("my-rules", &["*.md"]);

    cache
        .store(REPO, &ruleset, "1.0.0", &files(&[("one.md", "first")]))
        .unwrap();
    cache
        .store(REPO, &ruleset, "2.0.0", &files(&[("two.md", "second")]))
        .unwrap();

    // 1.0.0 was last read three hours ago; 2.0.0 just now
    let key = registry_key(RegistryKind::Git, REPO);
    let slot = patterns_key(&ruleset.patterns);
    let mut index = RegistryIndex::load(&layout, &key).unwrap();
    let entry = index.rulesets.get_mut(&slot).unwrap();
    entry.versions.get_mut("1.0.0").unwrap().last_accessed_on = hours_ago(3);
    index.save(&layout, &key).unwrap();

    let evictor = Evictor::new(&options);
    let report = evictor.cleanup_by_ttl(Duration::from_secs(3600)).unwrap();
    assert_eq!(report.removed_versions, 1);
    assert_eq!(report.removed_rulesets, 0);

    assert!(cache.get(REPO, &ruleset, "1.0.0").unwrap_err().is_not_found());
    let kept = cache.get(REPO, &ruleset, "2.0.0").unwrap();
    assert_eq!(kept.files["two.md"], b"second");

    let index = RegistryIndex::load(&layout, &key).unwrap();
    let versions: Vec<&String> = index.rulesets[&slot].versions.keys().collect();
    assert_eq!(versions, vec!["2.0.0"]);

    // Running again changes nothing
    let again = evictor.cleanup_by_ttl(Duration::from_secs(3600)).unwrap();
    assert_eq!(again.removed_versions, 0);
    assert_eq!(again.removed_rulesets, 0);
}

#[test]
fn test_ttl_cleanup_drops_expired_ruleset_and_index_entry() {
    let temp_dir = TempDir::new().unwrap();
    let options = CacheOptions::new(temp_dir.path());
    let layout = CacheLayout::new(temp_dir.path());
    let cache = RegistryCache::new(RegistryKind::Https, options.clone());
    let locator = "https://rules.example.com";

    cache
        .store(locator, &RulesetRef::named("stale"), "1.0.0", &files(&[("a", "a")]))
        .unwrap();
    cache
        .store(locator, &RulesetRef::named("fresh"), "1.0.0", &files(&[("b", "b")]))
        .unwrap();

    let key = registry_key(RegistryKind::Https, locator);
    let mut index = RegistryIndex::load(&layout, &key).unwrap();
    index
        .rulesets
        .get_mut(&ruleset_key("stale"))
        .unwrap()
        .last_accessed_on = "not a timestamp".to_string();
    index.save(&layout, &key).unwrap();

    let report = Evictor::new(&options)
        .cleanup_by_ttl(Duration::from_secs(3600))
        .unwrap();
    assert_eq!(report.removed_rulesets, 1);
    assert_eq!(report.removed_versions, 1);

    assert!(!layout.ruleset_dir(&key, &ruleset_key("stale")).exists());
    assert!(layout.ruleset_dir(&key, &ruleset_key("fresh")).exists());
    let index = RegistryIndex::load(&layout, &key).unwrap();
    assert!(!index.rulesets.contains_key(&ruleset_key("stale")));
}

#[test]
fn test_size_cleanup_evicts_least_recently_modified_first() {
    let temp_dir = TempDir::new().unwrap();
    let options = CacheOptions::new(temp_dir.path());
    let layout = CacheLayout::new(temp_dir.path());
    let cache = RegistryCache::new(RegistryKind::Local, options.clone());
    let locator = "/srv/rules";
    let key = registry_key(RegistryKind::Local, locator);
    let ruleset = RulesetRef::named("bulk");
    let mut payload = RulesetFiles::new();
    payload.insert("blob.bin".to_string(), vec![7u8; 64 * 1024]);

    // Stored in one order, aged in another
    let ages = [("1.0.0", 300), ("2.0.0", 100), ("3.0.0", 200), ("4.0.0", 400)];
    for (version, age) in ages {
        cache
            .store(locator, &ruleset, version, &payload)
            .unwrap();
        let dir = layout.version_dir(&key, &ruleset_key("bulk"), version);
        let mtime = FileTime::from_unix_time(1_700_000_000 - age, 0);
        filetime::set_file_mtime(&dir, mtime).unwrap();
    }

    let evictor = Evictor::new(&options);
    let under = evictor.cleanup_by_size(u64::MAX).unwrap();
    assert_eq!(under.removed_versions, 0);

    let budget = under.bytes_before - 100 * 1024;
    let report = evictor.cleanup_by_size(budget).unwrap();
    assert_eq!(report.removed_versions, 2);
    assert!(report.bytes_after <= budget);

    let exists = |v: &str| layout.version_dir(&key, &ruleset_key("bulk"), v).exists();
    assert!(!exists("4.0.0"));
    assert!(!exists("1.0.0"));
    assert!(exists("3.0.0"));
    assert!(exists("2.0.0"));

    let index = RegistryIndex::load(&layout, &key).unwrap();
    assert_eq!(index.version_count(), 2);
}

#[test]
fn test_mapping_recovery_preserves_original_bytes() {
    let temp_dir = TempDir::new().unwrap();
    let layout = CacheLayout::new(temp_dir.path());
    let broken = b"[{\"cacheKey\": \"abc\", oops";
    std::fs::write(layout.registry_map_path(), broken).unwrap();

    let store = RegistryMappingStore::new(layout.registry_map_path());
    let report = store.validate_and_recover().unwrap();

    let backup = report.backup_path.expect("corrupt document should be moved aside");
    assert_eq!(std::fs::read(&backup).unwrap(), broken);
    assert!(store.mappings().unwrap().is_empty());
    let rewritten: serde_json::Value =
        serde_json::from_slice(&std::fs::read(layout.registry_map_path()).unwrap()).unwrap();
    assert_eq!(rewritten, serde_json::json!([]));

    // The store keeps working after recovery
    let cache = RegistryCache::new(RegistryKind::Git, CacheOptions::new(temp_dir.path()));
    cache
        .store(REPO, &RulesetRef::with_patterns("r", &["*"]), "c0ffee", &files(&[("a", "a")]))
        .unwrap();
    assert_eq!(store.mappings().unwrap().len(), 1);
}

#[test]
fn test_get_refreshes_mapping_access_times() {
    let temp_dir = TempDir::new().unwrap();
    let layout = CacheLayout::new(temp_dir.path());
    let cache = RegistryCache::new(RegistryKind::GitLab, CacheOptions::new(temp_dir.path()));
    let locator = "https://gitlab.com/group/rules";
    let ruleset = RulesetRef::named("baseline");
    cache
        .store(locator, &ruleset, "1.0.0", &files(&[("a.yaml", "a")]))
        .unwrap();

    // Age both mapping records as if the last store was a day ago
    let key = registry_key(RegistryKind::GitLab, locator);
    let registries = RegistryMappingStore::new(layout.registry_map_path());
    let rulesets = RulesetMappingStore::new(layout.ruleset_map_path());
    let day_ago = hours_ago(24);
    registries.touch(|m| m.cache_key == key, &day_ago).unwrap();
    rulesets.touch(|m| m.registry_key == key, &day_ago).unwrap();

    let cached = cache.get(locator, &ruleset, "1.0.0").unwrap();
    assert_eq!(cached.access, AccessRefresh::Recorded);

    let registry = registries
        .find_mapping_by_url(RegistryKind::GitLab, locator)
        .unwrap()
        .unwrap();
    let ruleset_mapping = rulesets
        .find_mapping_by_ruleset(&key, "baseline", &[])
        .unwrap()
        .unwrap();
    for accessed in [&registry.last_accessed_on, &ruleset_mapping.last_accessed_on] {
        let accessed = chrono::DateTime::parse_from_rfc3339(accessed).unwrap();
        assert!(Utc::now().signed_duration_since(accessed) < ChronoDuration::minutes(1));
    }
}

#[test]
fn test_run_maintenance_with_defaults_keeps_fresh_entries() {
    let temp_dir = TempDir::new().unwrap();
    let options = CacheOptions::new(temp_dir.path());
    let cache = RegistryCache::new(RegistryKind::Git, options.clone());
    let ruleset = RulesetRef::with_patterns("r", &["*.md"]);
    cache
        .store(REPO, &ruleset, "abc123", &files(&[("a.md", "a")]))
        .unwrap();

    let config = CacheConfig::load_or_init(temp_dir.path()).unwrap();
    let report = run_maintenance(&options, &config).unwrap();

    assert!(!report.skipped);
    assert_eq!(report.ttl.removed_versions, 0);
    assert_eq!(report.size.removed_versions, 0);
    assert_eq!(report.pruned_mappings, 0);
    assert!(cache.get(REPO, &ruleset, "abc123").is_ok());
}
