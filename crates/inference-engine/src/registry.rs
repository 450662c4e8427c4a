//! Engine registry
//!
//! Only engines whose initialization succeeded are registered, so a lookup
//! miss for a known engine id means that engine is unavailable on this host.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use common::error::{Error, Result};
use model_manager::CacheControl;

use crate::adapter::{EngineAdapter, EngineCapabilities};

pub type SharedEngine = Arc<dyn EngineAdapter>;

/// Registered engines by id
#[derive(Default)]
pub struct EngineRegistry {
    engines: DashMap<String, SharedEngine>,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry").field("engines", &self.ids()).finish()
    }
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes and registers an engine
    ///
    /// Returns false, and leaves the registry unchanged, if initialization fails.
    pub async fn register(&self, engine: SharedEngine) -> bool {
        let id = engine.id().to_string();
        match engine.initialize().await {
            Ok(()) => {
                if self.engines.insert(id.clone(), engine).is_some() {
                    warn!("Engine '{}' was registered twice, replacing", id);
                }
                info!("Registered engine '{}'", id);
                true
            }
            Err(e) => {
                warn!("Engine '{}' failed to initialize and will be skipped: {}", id, e);
                false
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<SharedEngine> {
        self.engines.get(id).map(|entry| entry.value().clone())
    }

    /// Like [`get`](Self::get) but returns `EngineUnavailable` on a miss
    pub fn require(&self, id: &str) -> Result<SharedEngine> {
        self.get(id)
            .ok_or_else(|| Error::EngineUnavailable(format!("engine '{}' is not registered", id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.engines.contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn capabilities(&self) -> Vec<EngineCapabilities> {
        let mut caps: Vec<EngineCapabilities> = self.engines.iter().map(|e| e.value().capabilities()).collect();
        caps.sort_by(|a, b| a.engine.cmp(&b.engine));
        caps
    }

    /// Cache controls of every model-backed engine
    pub fn caches(&self) -> Vec<Arc<dyn CacheControl>> {
        self.engines
            .iter()
            .filter_map(|entry| entry.value().cache_control())
            .collect()
    }

    /// Clears every engine cache; returns the number of sessions dropped
    pub fn clear_all_caches(&self) -> usize {
        let cleared: usize = self.engines.iter().map(|entry| entry.value().clear_cache()).sum();
        info!("Cleared {} cached sessions across all engines", cleared);
        cleared
    }
}
