//! Registry locator normalization
//!
//! Equivalent locators (an SSH shorthand and its HTTPS form, a bucket path with
//! and without `s3://`, a relative and an absolute local path) must canonicalize
//! to the same string so they collide on the same cache key. Normalization is
//! total: malformed input degrades to a lowercase/trim form instead of failing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// The kind of registry a ruleset is fetched from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Git,
    GitLab,
    S3,
    Https,
    Local,
}

impl RegistryKind {
    pub const ALL: [RegistryKind; 5] = [
        RegistryKind::Git,
        RegistryKind::GitLab,
        RegistryKind::S3,
        RegistryKind::Https,
        RegistryKind::Local,
    ];

    /// The lowercase name used in cache keys and persisted documents
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryKind::Git => "git",
            RegistryKind::GitLab => "gitlab",
            RegistryKind::S3 => "s3",
            RegistryKind::Https => "https",
            RegistryKind::Local => "local",
        }
    }

    /// Whether rulesets of this kind are keyed by pattern set rather than by name
    pub fn is_git(&self) -> bool {
        matches!(self, RegistryKind::Git)
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        RegistryKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| format!("Unknown registry type: {s}"))
    }
}

/// Canonicalize a locator for a known registry kind
pub fn normalize(kind: RegistryKind, raw: &str) -> String {
    match kind {
        RegistryKind::Git => normalize_git(raw),
        RegistryKind::GitLab => normalize_gitlab(raw),
        RegistryKind::S3 => normalize_s3(raw),
        RegistryKind::Https => normalize_https(raw),
        RegistryKind::Local => normalize_local(raw),
    }
}

/// Canonicalize a locator whose registry type is only known as a string
///
/// Unrecognized types use the generic rule.
pub fn normalize_raw(registry_type: &str, raw: &str) -> String {
    match registry_type.parse::<RegistryKind>() {
        Ok(kind) => normalize(kind, raw),
        Err(_) => normalize_generic(raw),
    }
}

fn normalize_git(raw: &str) -> String {
    let mut s = raw.trim().to_lowercase();
    s = s.trim_end_matches('/').to_string();

    // ssh://git@host/path and git@host:path both become https://host/path
    if let Some(rest) = s.strip_prefix("ssh://") {
        let rest = rest.strip_prefix("git@").unwrap_or(rest);
        s = format!("https://{rest}");
    } else if let Some(rest) = s.strip_prefix("git@") {
        if let Some((host, path)) = rest.split_once(':') {
            s = format!("https://{host}/{}", path.trim_start_matches('/'));
        }
    }

    if let Some(stripped) = s.strip_suffix(".git") {
        s = stripped.trim_end_matches('/').to_string();
    }

    if !s.contains("://") && s.contains('.') {
        s = format!("https://{s}");
    }

    s
}

fn normalize_gitlab(raw: &str) -> String {
    let s = raw.trim().to_lowercase();
    let s = ensure_scheme(s.trim_end_matches('/'));
    collapse_path_slashes(&s)
}

fn normalize_s3(raw: &str) -> String {
    let s = raw.trim();
    let s = s.strip_prefix("s3://").unwrap_or(s);
    let s = s.replace('\\', "/");
    collapse_slashes(s.trim_end_matches('/'))
}

fn normalize_https(raw: &str) -> String {
    let trimmed = raw.trim();
    let with_scheme = ensure_scheme(trimmed);

    match url::Url::parse(&with_scheme) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);

            // The url crate already lowercases scheme/host and resolves dot segments
            let path = parsed.path().to_string();
            if path.len() > 1 && path.ends_with('/') {
                parsed.set_path(path.trim_end_matches('/'));
            }

            parsed.to_string()
        }
        Err(e) => {
            tracing::debug!("Falling back to lowercase normalization for {}: {}", trimmed, e);
            ensure_scheme(&trimmed.to_lowercase())
        }
    }
}

fn normalize_local(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix("file://").unwrap_or(trimmed);
    let path = Path::new(stripped);

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    clean_slash_path(&absolute.to_string_lossy().replace('\\', "/"))
}

fn normalize_generic(raw: &str) -> String {
    let s = raw.trim().to_lowercase();
    collapse_path_slashes(s.trim_end_matches('/'))
}

fn ensure_scheme(s: &str) -> String {
    if s.contains("://") {
        s.to_string()
    } else {
        format!("https://{s}")
    }
}

/// Collapse repeated `/` after the scheme separator, leaving `://` intact
fn collapse_path_slashes(s: &str) -> String {
    match s.split_once("://") {
        Some((scheme, rest)) => format!("{scheme}://{}", collapse_slashes(rest)),
        None => collapse_slashes(s),
    }
}

fn collapse_slashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut previous_slash = false;
    for c in s.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        out.push(c);
    }
    out
}

/// Lexically remove `.` and `..` segments from a forward-slash path
pub(crate) fn clean_slash_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}
