//! Rulebox cache CLI commands
//!
//! Inspect, clean and repair the registry cache shared by every rulebox
//! invocation on this machine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

use rulebox_core::cache::{
    get_cache_stats, CacheConfig, CacheLayout, CacheOptions, Evictor, RecoveryReport,
    RegistryMappingStore, RulesetMappingStore,
};

/// Cache subcommand for inspecting and maintaining the registry cache
#[derive(Parser, Debug)]
pub struct CacheCommand {
    #[clap(subcommand)]
    pub command: CacheSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum CacheSubcommand {
    /// Show total cache size and registry count
    Stats {
        /// Output as JSON
        #[clap(long)]
        json: bool,
    },

    /// Evict expired and least recently used entries
    Clean {
        /// Override the configured TTL in hours (0 disables the TTL sweep)
        #[clap(long)]
        ttl_hours: Option<u64>,

        /// Override the configured size budget in MB
        #[clap(long)]
        max_size_mb: Option<u64>,

        /// Output the cleanup report as JSON
        #[clap(long)]
        json: bool,
    },

    /// Recover corrupt mapping documents and drop orphaned records
    Repair,

    /// List cached registries and rulesets
    List {
        /// Output as JSON
        #[clap(long)]
        json: bool,
    },

    /// Show or change the persisted cache settings
    Config {
        #[clap(subcommand)]
        command: Option<ConfigCommand>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print config.json
    Show,

    /// Update one or more settings
    Set {
        /// Entries not accessed within this many hours are evicted
        #[clap(long)]
        ttl_hours: Option<u64>,

        /// Size budget for the cache in MB
        #[clap(long)]
        max_size_mb: Option<u64>,

        /// Enable or disable automatic maintenance
        #[clap(long)]
        cleanup_enabled: Option<bool>,
    },
}

impl CacheCommand {
    pub fn execute(self, root: &Path) -> Result<()> {
        match self.command {
            CacheSubcommand::Stats { json } => execute_stats(root, json),
            CacheSubcommand::Clean {
                ttl_hours,
                max_size_mb,
                json,
            } => execute_clean(root, ttl_hours, max_size_mb, json),
            CacheSubcommand::Repair => execute_repair(root),
            CacheSubcommand::List { json } => execute_list(root, json),
            CacheSubcommand::Config { command } => match command.unwrap_or(ConfigCommand::Show) {
                ConfigCommand::Show => execute_config_show(root),
                ConfigCommand::Set {
                    ttl_hours,
                    max_size_mb,
                    cleanup_enabled,
                } => execute_config_set(root, ttl_hours, max_size_mb, cleanup_enabled),
            },
        }
    }
}

fn execute_stats(root: &Path, json_output: bool) -> Result<()> {
    let stats = get_cache_stats(root)
        .with_context(|| format!("Failed to read cache at {}", root.display()))?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Cache root:  {}", root.display());
        println!("Registries:  {}", stats.registry_count);
        println!(
            "Total size:  {:.2} MB ({} bytes)",
            stats.total_size_mb, stats.total_size_bytes
        );
    }
    Ok(())
}

fn execute_clean(
    root: &Path,
    ttl_hours: Option<u64>,
    max_size_mb: Option<u64>,
    json_output: bool,
) -> Result<()> {
    let mut config = CacheConfig::load_or_init(root).context("Failed to load cache config")?;
    if let Some(hours) = ttl_hours {
        config.ttl_hours = hours;
    }
    if let Some(mb) = max_size_mb {
        config.max_size_mb = mb;
    }

    // An explicit clean runs even when automatic cleanup is disabled
    let evictor = Evictor::new(&CacheOptions::new(root));
    let ttl = evictor
        .cleanup_by_ttl(config.ttl())
        .context("TTL cleanup failed")?;
    let size = evictor
        .cleanup_by_size(config.max_size_bytes())
        .context("Size cleanup failed")?;
    let pruned = evictor
        .prune_orphaned_mappings()
        .context("Failed to prune orphaned mappings")?;

    if json_output {
        let report = serde_json::json!({
            "ttl": ttl,
            "size": size,
            "prunedMappings": pruned,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "TTL sweep ({}h): removed {} ruleset(s), {} version(s), {} untracked director(ies)",
        config.ttl_hours, ttl.removed_rulesets, ttl.removed_versions, ttl.removed_untracked
    );
    for (registry, reason) in &ttl.failed_registries {
        println!("  ⚠ skipped registry {registry}: {reason}");
    }
    println!(
        "Size sweep ({} MB): removed {} version(s), {} -> {} bytes",
        config.max_size_mb, size.removed_versions, size.bytes_before, size.bytes_after
    );
    println!("Pruned {pruned} orphaned mapping record(s)");
    Ok(())
}

fn execute_repair(root: &Path) -> Result<()> {
    let layout = CacheLayout::new(root);

    let registries = RegistryMappingStore::new(layout.registry_map_path());
    let report = registries
        .validate_and_recover()
        .context("Failed to repair registry mappings")?;
    print_recovery("registry-map.json", &report);

    let rulesets = RulesetMappingStore::new(layout.ruleset_map_path());
    let report = rulesets
        .validate_and_recover()
        .context("Failed to repair ruleset mappings")?;
    print_recovery("ruleset-map.json", &report);

    let pruned = Evictor::new(&CacheOptions::new(root))
        .prune_orphaned_mappings()
        .context("Failed to prune orphaned mappings")?;
    println!("Pruned {pruned} orphaned mapping record(s)");
    Ok(())
}

fn print_recovery(document: &str, report: &RecoveryReport) {
    match &report.backup_path {
        Some(backup) => println!(
            "✓ {document}: unreadable, moved aside to {} and reset",
            backup.display()
        ),
        None if report.dropped > 0 => println!(
            "✓ {document}: dropped {} invalid record(s), {} kept",
            report.dropped, report.valid
        ),
        None => println!("✓ {document}: {} record(s), no problems found", report.valid),
    }
}

/// Table row for cached registries
#[derive(Tabled)]
struct RegistryRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Type")]
    registry_type: String,
    #[tabled(rename = "Locator")]
    url: String,
    #[tabled(rename = "Last Accessed")]
    last_accessed: String,
}

/// Table row for cached rulesets
#[derive(Tabled)]
struct RulesetRow {
    #[tabled(rename = "Registry")]
    registry: String,
    #[tabled(rename = "Ruleset")]
    name: String,
    #[tabled(rename = "Patterns")]
    patterns: String,
    #[tabled(rename = "Last Accessed")]
    last_accessed: String,
}

fn execute_list(root: &Path, json_output: bool) -> Result<()> {
    let layout = CacheLayout::new(root);
    let registries = RegistryMappingStore::new(layout.registry_map_path())
        .mappings()
        .context("Failed to read registry mappings")?;
    let rulesets = RulesetMappingStore::new(layout.ruleset_map_path())
        .mappings()
        .context("Failed to read ruleset mappings")?;

    if json_output {
        let listing = serde_json::json!({
            "registries": registries,
            "rulesets": rulesets,
        });
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if registries.is_empty() {
        println!("The cache is empty.");
        return Ok(());
    }

    let registry_rows: Vec<RegistryRow> = registries
        .iter()
        .map(|m| RegistryRow {
            key: short_key(&m.cache_key),
            registry_type: m.registry_type.to_string(),
            url: m.url.clone(),
            last_accessed: date_only(&m.last_accessed_on),
        })
        .collect();
    println!("Cached registries:\n");
    println!("{}", render(&registry_rows));

    if !rulesets.is_empty() {
        let ruleset_rows: Vec<RulesetRow> = rulesets
            .iter()
            .map(|m| RulesetRow {
                registry: short_key(&m.registry_key),
                name: m.ruleset_name.clone(),
                patterns: m.patterns.join(", "),
                last_accessed: date_only(&m.last_accessed_on),
            })
            .collect();
        println!("\nCached rulesets:\n");
        println!("{}", render(&ruleset_rows));
    }

    Ok(())
}

fn execute_config_show(root: &Path) -> Result<()> {
    let config = CacheConfig::load_or_init(root).context("Failed to load cache config")?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn execute_config_set(
    root: &Path,
    ttl_hours: Option<u64>,
    max_size_mb: Option<u64>,
    cleanup_enabled: Option<bool>,
) -> Result<()> {
    let mut config = CacheConfig::load_or_init(root).context("Failed to load cache config")?;
    if let Some(hours) = ttl_hours {
        config.ttl_hours = hours;
    }
    if let Some(mb) = max_size_mb {
        config.max_size_mb = mb;
    }
    if let Some(enabled) = cleanup_enabled {
        config.cleanup_enabled = enabled;
    }

    config
        .save(root)
        .context("Failed to write cache config")?;
    println!("✓ Updated {}", CacheConfig::path(root).display());
    Ok(())
}

fn render<T: Tabled>(rows: &[T]) -> String {
    Table::new(rows)
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .to_string()
}

fn short_key(key: &str) -> String {
    key.chars().take(12).collect()
}

fn date_only(timestamp: &str) -> String {
    timestamp
        .split('T')
        .next()
        .unwrap_or(timestamp)
        .to_string()
}
