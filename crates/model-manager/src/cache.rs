//! Per-engine model session cache
//!
//! Each engine owns one `ModelCache` for its session type. Entries are keyed by
//! `model_type@quality` and evicted least-recently-used first whenever an
//! insertion would exceed the active budget. Loading happens outside the lock,
//! so the lock is never held across an `.await`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use common::error::Result;
use common::models::{cache_key, TierBudget};
use common::types::QualityLevel;
use common::utils::format_bytes;

/// Limits a cache enforces on insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBudget {
    /// Maximum number of sessions
    pub max_models: usize,
    /// Maximum total bytes
    pub max_bytes: u64,
}

impl CacheBudget {
    pub fn new(max_models: usize, max_bytes: u64) -> Self {
        Self {
            max_models: max_models.max(1),
            max_bytes,
        }
    }

    /// Scales both limits, keeping room for at least one model
    pub fn scaled(&self, factor: f64) -> Self {
        let factor = if factor.is_finite() { factor.clamp(0.0, 1.0) } else { 1.0 };
        Self {
            max_models: ((self.max_models as f64 * factor).floor() as usize).max(1),
            max_bytes: (self.max_bytes as f64 * factor).floor() as u64,
        }
    }
}

impl From<&TierBudget> for CacheBudget {
    fn from(budget: &TierBudget) -> Self {
        CacheBudget::new(budget.max_models, budget.cache_byte_budget)
    }
}

/// A freshly loaded session and its in-memory size
#[derive(Debug)]
pub struct LoadedSession<S> {
    pub session: S,
    pub size_bytes: u64,
}

/// Cached session record
#[derive(Debug)]
pub struct CachedSession<S> {
    pub cache_key: String,
    pub handle: Arc<S>,
    pub loaded_at: Instant,
    /// Logical clock value of the last access
    pub last_used_at: u64,
    pub size_bytes: u64,
}

/// Session returned by [`ModelCache::get_or_load`]
#[derive(Debug)]
pub struct CacheLookup<S> {
    pub handle: Arc<S>,
    /// True if the session came from the cache
    pub cache_hit: bool,
    /// False if the session was too large to cache
    pub cached: bool,
}

/// Point-in-time cache usage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUsage {
    pub entries: usize,
    pub bytes: u64,
    pub max_models: usize,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheState<S> {
    entries: HashMap<String, CachedSession<S>>,
    budget: CacheBudget,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<S> CacheState<S> {
    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Evicts LRU entries until `incoming_bytes` more would fit in one more slot
    fn make_room(&mut self, cache: &str, incoming_bytes: u64, incoming_slots: usize) -> Vec<String> {
        let mut evicted = Vec::new();

        while !self.entries.is_empty()
            && (self.entries.len() + incoming_slots > self.budget.max_models
                || self.total_bytes() + incoming_bytes > self.budget.max_bytes)
        {
            let victim = self
                .entries
                .values()
                .min_by_key(|e| e.last_used_at)
                .map(|e| e.cache_key.clone());

            let Some(key) = victim else { break };
            if let Some(entry) = self.entries.remove(&key) {
                debug!(
                    "Evicted '{}' from {} cache ({})",
                    key,
                    cache,
                    format_bytes(entry.size_bytes)
                );
                self.evictions += 1;
                evicted.push(key);
            }
        }

        evicted
    }
}

/// Keyed LRU session store under a budget
pub struct ModelCache<S> {
    /// Cache name, usually the owning engine id
    name: String,

    /// Entries and counters
    state: Mutex<CacheState<S>>,
}

impl<S> std::fmt::Debug for ModelCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ModelCache")
            .field("name", &self.name)
            .field("entries", &state.entries.len())
            .field("budget", &state.budget)
            .finish()
    }
}

impl<S> ModelCache<S> {
    /// Creates an empty cache
    pub fn new(name: impl Into<String>, budget: CacheBudget) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                budget,
                clock: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the cached session or loads, caches and returns it
    ///
    /// Loader failures propagate and nothing is cached. A session larger than the
    /// whole byte budget is returned but not cached.
    pub async fn get_or_load<F, Fut>(
        &self,
        model_type: &str,
        quality: QualityLevel,
        loader: F,
    ) -> Result<CacheLookup<S>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LoadedSession<S>>>,
    {
        let key = cache_key(model_type, quality);

        {
            let mut state = self.state.lock();
            let now = state.tick();
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.last_used_at = now;
                let handle = entry.handle.clone();
                state.hits += 1;
                debug!("Cache hit for '{}' in {} cache", key, self.name);
                return Ok(CacheLookup { handle, cache_hit: true, cached: true });
            }
            state.misses += 1;
        }

        debug!("Cache miss for '{}' in {} cache, loading", key, self.name);
        let loaded = loader().await?;
        let handle = Arc::new(loaded.session);

        let cached = self.insert(&key, handle.clone(), loaded.size_bytes);
        Ok(CacheLookup { handle, cache_hit: false, cached })
    }

    fn insert(&self, key: &str, handle: Arc<S>, size_bytes: u64) -> bool {
        let mut state = self.state.lock();

        if size_bytes > state.budget.max_bytes {
            warn!(
                "Session '{}' ({}) exceeds the {} cache budget of {}, not caching",
                key,
                format_bytes(size_bytes),
                self.name,
                format_bytes(state.budget.max_bytes)
            );
            return false;
        }

        // A concurrent load of the same key may have finished first.
        state.entries.remove(key);
        state.make_room(&self.name, size_bytes, 1);

        let now = state.tick();
        state.entries.insert(
            key.to_string(),
            CachedSession {
                cache_key: key.to_string(),
                handle,
                loaded_at: Instant::now(),
                last_used_at: now,
                size_bytes,
            },
        );
        true
    }

    /// Replaces the budget and evicts down to it
    pub fn set_budget(&self, budget: CacheBudget) -> usize {
        let mut state = self.state.lock();
        state.budget = budget;
        let evicted = state.make_room(&self.name, 0, 0).len();
        info!(
            "{} cache budget set to {} models / {} ({} evicted)",
            self.name,
            budget.max_models,
            format_bytes(budget.max_bytes),
            evicted
        );
        evicted
    }

    /// Scales the budget by `factor` and evicts down to it
    pub fn shrink(&self, factor: f64) -> usize {
        let budget = self.state.lock().budget.scaled(factor);
        self.set_budget(budget)
    }

    /// Drops every cached session
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.evictions += count as u64;
        if count > 0 {
            info!("Cleared {} sessions from {} cache", count, self.name);
        }
        count
    }

    pub fn contains(&self, model_type: &str, quality: QualityLevel) -> bool {
        self.state.lock().entries.contains_key(&cache_key(model_type, quality))
    }

    pub fn budget(&self) -> CacheBudget {
        self.state.lock().budget
    }

    pub fn usage(&self) -> CacheUsage {
        let state = self.state.lock();
        CacheUsage {
            entries: state.entries.len(),
            bytes: state.total_bytes(),
            max_models: state.budget.max_models,
            max_bytes: state.budget.max_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    /// Cached keys, least recently used first
    pub fn keys_by_recency(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut entries: Vec<(&String, u64)> = state
            .entries
            .iter()
            .map(|(k, e)| (k, e.last_used_at))
            .collect();
        entries.sort_by_key(|(_, used)| *used);
        entries.into_iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Object-safe control surface over caches of any session type
pub trait CacheControl: Send + Sync {
    fn name(&self) -> &str;
    fn set_budget(&self, budget: CacheBudget) -> usize;
    fn shrink(&self, factor: f64) -> usize;
    fn clear(&self) -> usize;
    fn usage(&self) -> CacheUsage;
}

impl<S: Send + Sync> CacheControl for ModelCache<S> {
    fn name(&self) -> &str {
        ModelCache::name(self)
    }

    fn set_budget(&self, budget: CacheBudget) -> usize {
        ModelCache::set_budget(self, budget)
    }

    fn shrink(&self, factor: f64) -> usize {
        ModelCache::shrink(self, factor)
    }

    fn clear(&self) -> usize {
        ModelCache::clear(self)
    }

    fn usage(&self) -> CacheUsage {
        ModelCache::usage(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loaded(tag: &str, size_bytes: u64) -> Result<LoadedSession<String>> {
        Ok(LoadedSession {
            session: tag.to_string(),
            size_bytes,
        })
    }

    async fn load(cache: &ModelCache<String>, model: &str, size: u64) -> CacheLookup<String> {
        cache
            .get_or_load(model, QualityLevel::Low, || async move { loaded(model, size) })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let cache = ModelCache::new("tensor", CacheBudget::new(2, 1000));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let lookup = cache
                .get_or_load("edge_net", QualityLevel::High, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    loaded("edge", 100)
                })
                .await
                .unwrap();
            assert_eq!(*lookup.handle, "edge");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let usage = cache.usage();
        assert_eq!((usage.hits, usage.misses, usage.entries), (2, 1, 1));
        assert!(cache.contains("edge_net", QualityLevel::High));
        assert!(!cache.contains("edge_net", QualityLevel::Low));
    }

    #[tokio::test]
    async fn test_sixth_model_evicts_exactly_lru() {
        let cache = ModelCache::new("tensor", CacheBudget::new(5, 10_000));
        for model in ["m1", "m2", "m3", "m4", "m5"] {
            load(&cache, model, 10).await;
        }
        // Touch m1 so m2 becomes least recently used.
        assert!(load(&cache, "m1", 10).await.cache_hit);

        load(&cache, "m6", 10).await;

        let usage = cache.usage();
        assert_eq!(usage.entries, 5);
        assert_eq!(usage.evictions, 1);
        assert!(!cache.contains("m2", QualityLevel::Low));
        for model in ["m1", "m3", "m4", "m5", "m6"] {
            assert!(cache.contains(model, QualityLevel::Low), "{} missing", model);
        }
    }

    #[tokio::test]
    async fn test_byte_budget_respected() {
        let cache = ModelCache::new("pipeline", CacheBudget::new(10, 100));
        for (i, size) in [40u64, 40, 30, 60, 10, 90, 5].into_iter().enumerate() {
            let name = format!("m{}", i);
            cache
                .get_or_load(&name, QualityLevel::Low, || async { loaded("x", size) })
                .await
                .unwrap();
            let usage = cache.usage();
            assert!(usage.bytes <= 100, "bytes {} after {}", usage.bytes, name);
            assert!(usage.entries <= 10);
        }
    }

    #[tokio::test]
    async fn test_oversized_session_returned_uncached() {
        let cache = ModelCache::new("tensor", CacheBudget::new(3, 50));
        load(&cache, "small", 20).await;

        let lookup = load(&cache, "huge", 500).await;
        assert_eq!(*lookup.handle, "huge");
        assert!(!lookup.cached);
        assert!(!cache.contains("huge", QualityLevel::Low));
        assert!(cache.contains("small", QualityLevel::Low));
    }

    #[tokio::test]
    async fn test_loader_failure_not_cached() {
        let cache: ModelCache<String> = ModelCache::new("tensor", CacheBudget::new(3, 50));
        let result = cache
            .get_or_load("broken", QualityLevel::Low, || async {
                Err(Error::ModelLoad("bad magic".to_string()))
            })
            .await;
        assert!(matches!(result, Err(Error::ModelLoad(_))));
        assert_eq!(cache.usage().entries, 0);
    }

    #[tokio::test]
    async fn test_shrink_and_clear() {
        let cache = ModelCache::new("tensor", CacheBudget::new(4, 400));
        for model in ["a", "b", "c", "d"] {
            load(&cache, model, 50).await;
        }

        let evicted = CacheControl::shrink(&cache, 0.5);
        assert_eq!(evicted, 2);
        assert_eq!(cache.budget(), CacheBudget::new(2, 200));
        assert_eq!(cache.keys_by_recency(), vec!["c@low".to_string(), "d@low".to_string()]);

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.usage().entries, 0);

        assert_eq!(CacheControl::shrink(&cache, 0.0), 0);
        assert_eq!(cache.budget().max_models, 1);
    }

    #[test]
    fn test_budget_scaling_keeps_one_model() {
        let budget = CacheBudget::new(3, 300);
        assert_eq!(budget.scaled(0.1), CacheBudget { max_models: 1, max_bytes: 30 });
        assert_eq!(budget.scaled(f64::NAN), budget);
        assert_eq!(CacheBudget::new(0, 10).max_models, 1);
    }

    #[test]
    fn test_cache_control_is_object_safe() {
        let caches: Vec<Arc<dyn CacheControl>> = vec![
            Arc::new(ModelCache::<String>::new("tensor", CacheBudget::new(1, 1))),
            Arc::new(ModelCache::<Vec<u8>>::new("pipeline", CacheBudget::new(1, 1))),
        ];
        let names: Vec<&str> = caches.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["tensor", "pipeline"]);
    }
}
