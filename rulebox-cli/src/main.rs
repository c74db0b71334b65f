//! Rulebox - fetch and install versioned rulesets from heterogeneous registries
//!
//! Entry point for the `rulebox` binary. Only the cache maintenance surface
//! lives here; registry clients and the installer drive the cache through
//! `rulebox_core::cache` directly.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rulebox_core::cache::CacheOptions;

mod cache_cli;

use cache_cli::CacheCommand;

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "rulebox",
    about = "Fetch and install versioned rulesets from Git, S3, HTTPS and local registries",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Set log level
    #[clap(long, default_value = "warn", global = true)]
    log_level: LogLevel,

    /// Emit logs as JSON lines on stderr
    #[clap(long, global = true)]
    json_logs: bool,

    /// Cache root (defaults to the platform cache directory)
    #[clap(long, global = true, env = "RULEBOX_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect and maintain the registry cache
    Cache(CacheCommand),
}

fn initialize_tracing(log_level: &LogLevel, json_logs: bool) {
    let filter = EnvFilter::new(log_level.to_filter_directive());

    if json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        // Logs go to stderr so stdout stays clean for --json output
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn resolve_cache_root(cache_dir: Option<PathBuf>) -> Result<PathBuf> {
    match cache_dir {
        Some(dir) => Ok(dir),
        None => CacheOptions::default_root().context("Failed to determine the cache directory"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing(&cli.log_level, cli.json_logs);

    let root = resolve_cache_root(cli.cache_dir)?;
    tracing::debug!("Using cache root {}", root.display());

    match cli.command {
        Command::Cache(command) => {
            // Cache operations are synchronous filesystem work
            tokio::task::spawn_blocking(move || command.execute(&root))
                .await
                .context("Cache command panicked")?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "rulebox",
            "cache",
            "stats",
            "--cache-dir",
            "/tmp/rulebox-cache",
            "--log-level",
            "debug",
            "--json-logs",
        ])
        .unwrap();

        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/rulebox-cache")));
        assert!(matches!(cli.log_level, LogLevel::Debug));
        assert!(cli.json_logs);
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        assert!(Cli::try_parse_from(["rulebox", "--log-level", "loud", "cache", "stats"]).is_err());
    }

    #[test]
    fn test_explicit_cache_dir_wins() {
        let root = resolve_cache_root(Some(PathBuf::from("/srv/cache"))).unwrap();
        assert_eq!(root, PathBuf::from("/srv/cache"));
    }
}
