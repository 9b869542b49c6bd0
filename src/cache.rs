//! Cache key derivation and the artifact cache boundary.
//!
//! Keys are hierarchical: an exact per-commit key, then progressively less
//! specific fallbacks so unrelated job variants can still share a restored
//! dependency cache.

use crate::matrix::JobConfiguration;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// The job dimensions that participate in cache key construction. All
/// other fields (extra test flags, etc.) are ignored so variants that only
/// differ in install-irrelevant ways share fallback keys.
pub const CACHE_KEY_DIMENSIONS: [&str; 3] = ["platform", "toolchain", "arch"];

/// Bumped to invalidate every dependency cache at once.
pub const CACHE_REVISION: u32 = 1;

/// An ordered list of lookup keys, most specific first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheKey {
    chain: Vec<String>,
}

impl CacheKey {
    /// The exact-match key (includes the commit hash).
    pub fn exact(&self) -> &str {
        &self.chain[0]
    }

    /// Fallback keys, most specific first, excluding the exact key.
    pub fn fallbacks(&self) -> &[String] {
        &self.chain[1..]
    }

    /// The whole chain, most specific first.
    pub fn chain(&self) -> &[String] {
        &self.chain
    }
}

/// Derive the cache key fallback chain for a job configuration.
///
/// Produces `[{p}-{t}-{a}-deps-v{N}-{sha}, {p}-{t}-{a}-deps-v{N}, {p}-{t}-{a}-deps]`.
/// A job missing a whitelisted dimension substitutes `any`. Pure function
/// of its inputs.
pub fn resolve_cache_key(job: &JobConfiguration, commit_sha: &str) -> CacheKey {
    let stable: Vec<&str> = CACHE_KEY_DIMENSIONS
        .iter()
        .map(|dim| job.get(dim).unwrap_or("any"))
        .collect();

    let generic = format!("{}-deps", stable.join("-"));
    let partial = format!("{}-v{}", generic, CACHE_REVISION);
    let exact = format!("{}-{}", partial, commit_sha);

    CacheKey {
        chain: vec![exact, partial, generic],
    }
}

/// In-memory key-value artifact cache with exact-then-fallback lookup.
///
/// Fallback keys match by prefix: a restore for `linux-3.9-x64-deps-v1`
/// finds any stored `linux-3.9-x64-deps-v1-<sha>` entry. The real store is
/// an external shared resource with its own eviction policy; this models
/// only the lookup contract.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: RwLock<BTreeMap<String, Arc<Vec<u8>>>>,
}

impl CacheStore {
    /// Create an empty cache store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store content under a key.
    pub fn put(&self, key: impl Into<String>, content: Vec<u8>) {
        let key = key.into();
        debug!("cache put: {}", key);
        self.entries.write().insert(key, Arc::new(content));
    }

    /// Restore the most specific match for a key chain, returning the
    /// matched key and content, or `None` on a full miss.
    pub fn restore(&self, key: &CacheKey) -> Option<(String, Arc<Vec<u8>>)> {
        let entries = self.entries.read();
        for candidate in key.chain() {
            // Exact hit first
            if let Some(content) = entries.get(candidate) {
                return Some((candidate.clone(), content.clone()));
            }
            // Then the last entry extending this key past a `-` boundary,
            // so `...-v1` never claims a `...-v10-<sha>` entry.
            let hit = entries
                .range(candidate.clone()..)
                .take_while(|(k, _)| k.starts_with(candidate.as_str()))
                .filter(|(k, _)| extends_at_boundary(k, candidate))
                .last();
            if let Some((k, content)) = hit {
                return Some((k.clone(), content.clone()));
            }
        }
        None
    }

    /// Discard every entry under a key prefix. Used when a cancelled job
    /// must not leave partial writes behind as valid fallback keys.
    pub fn discard_partial(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write();
        let doomed: Vec<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| k.as_str() == prefix || extends_at_boundary(k, prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        doomed.len()
    }

    /// Number of stored entries.
    pub fn count(&self) -> usize {
        self.entries.read().len()
    }
}

/// True when `key` continues `prefix` with a `-` separator, i.e. `prefix`
/// ends on a whole key segment rather than inside one.
fn extends_at_boundary(key: &str, prefix: &str) -> bool {
    key.as_bytes().get(prefix.len()) == Some(&b'-')
}
