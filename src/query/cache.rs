use std::hash::Hasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use xxhash_rust::xxh64::Xxh64;

use crate::query::planner::{Planner, QueryPlan};
use crate::types::Result;

/// Default number of plans kept by [`PlanCache::default`].
pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 256;

/// Hit/miss counters of a [`PlanCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlanCacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that had to plan.
    pub misses: u64,
    /// Plans currently cached.
    pub len: usize,
}

struct Entry {
    collection: String,
    spec: String,
    epoch: u64,
    plan: Arc<QueryPlan>,
}

/// LRU cache of plans keyed by collection, spec text and registry epoch.
///
/// Registering a link bumps the registry epoch, so plans built against an
/// older graph never match again and age out.
pub struct PlanCache {
    entries: Mutex<LruCache<u64, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PlanCache {
    /// Creates a cache holding at most `capacity` plans (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached plan for `(collection, spec)` or plans and caches it.
    pub fn get_or_plan(
        &self,
        planner: &Planner,
        collection: &str,
        spec: &Value,
    ) -> Result<Arc<QueryPlan>> {
        let epoch = planner.registry().epoch();
        let text = spec.to_string();
        let key = cache_key(collection, &text, epoch);
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get(&key) {
                if entry.epoch == epoch && entry.collection == collection && entry.spec == text {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(&entry.plan));
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let plan = Arc::new(planner.plan(collection, spec)?);
        self.entries.lock().put(
            key,
            Entry {
                collection: collection.to_owned(),
                spec: text,
                epoch,
                plan: Arc::clone(&plan),
            },
        );
        Ok(plan)
    }

    /// Drops every cached plan.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Current counters.
    pub fn stats(&self) -> PlanCacheStats {
        PlanCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: self.entries.lock().len(),
        }
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(DEFAULT_PLAN_CACHE_CAPACITY)
    }
}

fn cache_key(collection: &str, spec: &str, epoch: u64) -> u64 {
    let mut hasher = Xxh64::new(0);
    hasher.write(collection.as_bytes());
    hasher.write_u8(0);
    hasher.write(spec.as_bytes());
    hasher.write_u64(epoch);
    hasher.finish()
}
