//! Bounded cache of decoded index artifacts.
//!
//! Artifacts are immutable per storage key (the key carries the version), so entries never
//! need invalidation; they only age out under the entry and byte bounds.

use std::sync::Arc;

use common::artifact::LoadedArtifact;
use moka::{notification::RemovalCause, policy::EvictionPolicy, sync::Cache};
use tracing::debug;

/// LRU cache keyed by artifact storage key.
///
/// Both bounds are enforced through a single weigher: every entry weighs at least
/// `max_bytes / max_entries`, so no more than `max_entries` artifacts fit at once.
#[derive(Clone)]
pub struct ArtifactCache {
    cache: Cache<String, Arc<LoadedArtifact>>,
}

impl ArtifactCache {
    pub fn new(max_entries: u64, max_bytes: u64) -> Self {
        let max_entries = max_entries.max(1);
        let capacity = max_bytes.max(max_entries);
        let floor = capacity / max_entries;

        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .weigher(move |_key: &String, artifact: &Arc<LoadedArtifact>| {
                let weight = (artifact.byte_size() as u64).max(floor);
                u32::try_from(weight).unwrap_or(u32::MAX)
            })
            .eviction_listener(
                |key: Arc<String>, artifact: Arc<LoadedArtifact>, cause: RemovalCause| {
                    debug!(
                        artifact_key = %key,
                        doc_hash = %artifact.manifest.doc_hash,
                        ?cause,
                        "artifact evicted from cache"
                    );
                },
            )
            .build();

        Self { cache }
    }

    pub fn get(&self, key: &str) -> Option<Arc<LoadedArtifact>> {
        self.cache.get(key)
    }

    pub fn insert(&self, key: &str, artifact: Arc<LoadedArtifact>) {
        self.cache.insert(key.to_string(), artifact);
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.cache.entry_count(),
            weighted_size: self.cache.weighted_size(),
        }
    }

    /// Applies pending evictions so `stats` reflects the bounds.
    pub fn sync(&self) {
        self.cache.run_pending_tasks();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entry_count: u64,
    pub weighted_size: u64,
}
