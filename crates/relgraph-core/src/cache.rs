//! Resolution Cache
//!
//! Memoizes resolution outcomes keyed by request fingerprint. An entry is
//! only returned while its generation equals the store's current one.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use relgraph_state::{ArtifactId, Generation};
use sha2::{Digest, Sha256};

use crate::engine::ResolveOutcome;
use crate::metrics::METRICS;
use crate::request::ResolutionRequest;

#[derive(Debug, Clone)]
struct CacheEntry {
    generation: Generation,
    outcome: ResolveOutcome,
}

pub struct ResolutionCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl ResolutionCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached outcome for `fingerprint` computed at `generation`.
    ///
    /// An entry from another generation is evicted and reported as a miss.
    pub fn get(&self, fingerprint: &str, generation: Generation) -> Option<ResolveOutcome> {
        let mut entries = self.lock();
        let cached = entries
            .get(fingerprint)
            .map(|entry| (entry.generation, entry.outcome.clone()));
        let hit = match cached {
            Some((stored, outcome)) if stored == generation => Some(outcome),
            Some(_) => {
                entries.pop(fingerprint);
                None
            }
            None => None,
        };
        if hit.is_some() {
            METRICS.inc_cache_hits();
        } else {
            METRICS.inc_cache_misses();
        }
        hit
    }

    pub fn put(&self, fingerprint: String, generation: Generation, outcome: ResolveOutcome) {
        self.lock().put(
            fingerprint,
            CacheEntry {
                generation,
                outcome,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// SHA-256 hex of the canonical `(artifact, request)` pair.
pub fn fingerprint(artifact: &ArtifactId, request: &ResolutionRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(artifact.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(request.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
