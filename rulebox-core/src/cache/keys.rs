//! Cache key derivation
//!
//! Keys are lowercase hex SHA-256 digests of canonical strings. They must be
//! stable across processes and machines, so nothing machine-local is mixed in.

use sha2::{Digest, Sha256};

use super::normalize::{normalize, RegistryKind};

/// Length of every cache key in hex characters
pub const CACHE_KEY_LEN: usize = 64;

/// Canonical input for an empty pattern list
const EMPTY_PATTERNS_SENTINEL: &str = "__EMPTY__";

/// Hash a string using SHA-256, hex encoded without a prefix
pub fn hash_string(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Key for a registry: `SHA256("{type}:{normalized locator}")`
pub fn registry_key(kind: RegistryKind, raw_locator: &str) -> String {
    hash_string(&format!("{}:{}", kind.as_str(), normalize(kind, raw_locator)))
}

/// Key for a non-Git ruleset, derived from its trimmed name
pub fn ruleset_key(name: &str) -> String {
    hash_string(name.trim())
}

/// Key for a Git pattern selection, independent of order and surrounding whitespace
pub fn patterns_key(patterns: &[String]) -> String {
    if patterns.is_empty() {
        return hash_string(EMPTY_PATTERNS_SENTINEL);
    }
    hash_string(&normalize_patterns(patterns))
}

/// Trimmed, sorted, comma-joined form of a pattern list
pub fn normalize_patterns(patterns: &[String]) -> String {
    let mut trimmed: Vec<&str> = patterns.iter().map(|p| p.trim()).collect();
    trimmed.sort_unstable();
    trimmed.join(",")
}

/// Whether `key` has the shape of a cache key (64 lowercase hex characters)
pub fn is_valid_cache_key(key: &str) -> bool {
    key.len() == CACHE_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
