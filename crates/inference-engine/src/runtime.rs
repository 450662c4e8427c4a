//! Shared plumbing for model-backed engines
//!
//! Resolves the model variant for the active tier, fetches and parses artifacts
//! on cache misses, and tracks the engine's execution backend.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::error::{Error, Result};
use common::models::{CapabilitySnapshot, ModelDescriptor};
use common::types::ProcessingOptions;
use common::utils::ensure_not_cancelled;
use hardware_profiler::ActiveTier;
use model_manager::{ArtifactSource, CacheBudget, CacheLookup, LoadedSession, ModelCache, ModelCatalog};

use crate::backend::{resolve_backend, ExecutionBackend};

/// Dependencies handed to every model-backed engine
#[derive(Clone)]
pub struct EngineContext {
    /// Capabilities detected at startup
    pub snapshot: CapabilitySnapshot,
    /// Current tier
    pub active_tier: Arc<ActiveTier>,
    /// All model descriptors
    pub models: ModelCatalog,
    /// Artifact source for cache misses
    pub fetcher: Arc<dyn ArtifactSource>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("snapshot", &self.snapshot)
            .field("tier", &self.active_tier.current_id())
            .finish()
    }
}

/// A session resolved for one request
pub(crate) struct ResolvedSession<S> {
    pub lookup: CacheLookup<S>,
    pub model_key: String,
}

pub(crate) struct ModelRuntime<S> {
    engine: &'static str,
    context: EngineContext,
    models: ModelCatalog,
    cache: Arc<ModelCache<S>>,
    backend: RwLock<Option<ExecutionBackend>>,
}

impl<S: Send + Sync + 'static> ModelRuntime<S> {
    pub fn new(engine: &'static str, context: EngineContext) -> Self {
        let budget = CacheBudget::from(&context.active_tier.current().budget);
        let models = context.models.for_engine(engine);
        Self {
            engine,
            cache: Arc::new(ModelCache::new(engine, budget)),
            models,
            context,
            backend: RwLock::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<ModelCache<S>> {
        &self.cache
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.models.model_types(self.engine)
    }

    /// Resolves and records the execution backend
    pub fn initialize<F>(&self, init: F) -> Result<ExecutionBackend>
    where
        F: FnMut(ExecutionBackend) -> Result<()>,
    {
        if self.models.model_types(self.engine).is_empty() {
            return Err(Error::EngineUnavailable(format!(
                "engine '{}' has no model descriptors",
                self.engine
            )));
        }

        let backend = resolve_backend(self.engine, &self.context.snapshot, init);
        *self.backend.write() = Some(backend);
        Ok(backend)
    }

    pub fn backend(&self) -> Option<ExecutionBackend> {
        *self.backend.read()
    }

    /// Backend for a request; fails if the engine was never initialized
    pub fn require_backend(&self) -> Result<ExecutionBackend> {
        self.backend()
            .ok_or_else(|| Error::EngineUnavailable(format!("engine '{}' is not initialized", self.engine)))
    }

    /// Whether filters may run data-parallel under the current tier
    pub fn parallel(&self, backend: ExecutionBackend) -> bool {
        backend.supports_parallelism() && self.context.active_tier.settings().allows_parallelism
    }

    /// Returns the session for `model_id`, loading it on a cache miss
    pub async fn session<P>(
        &self,
        model_id: &str,
        options: &ProcessingOptions,
        cancel: &CancellationToken,
        parse: P,
    ) -> Result<ResolvedSession<S>>
    where
        P: FnOnce(Bytes, &ModelDescriptor) -> Result<S>,
    {
        let budget = self.context.active_tier.current().budget;
        let quality = options.quality.unwrap_or(budget.quality_level);
        let descriptor: ModelDescriptor = self
            .models
            .resolve(self.engine, model_id, quality, budget.max_model_bytes)?
            .clone();
        ensure_not_cancelled(cancel, "model load")?;

        let model_key = descriptor.cache_key();
        let model_type = descriptor.model_type.clone();
        let level = descriptor.quality_level;
        let fetcher = self.context.fetcher.clone();

        let lookup = self
            .cache
            .get_or_load(&model_type, level, || async move {
                let bytes = fetcher.fetch(&descriptor, cancel).await?;
                ensure_not_cancelled(cancel, "model load")?;
                let session = parse(bytes, &descriptor)?;
                debug!("Parsed artifact for '{}'", descriptor.cache_key());
                Ok(LoadedSession {
                    session,
                    size_bytes: descriptor.approx_size_bytes,
                })
            })
            .await?;

        Ok(ResolvedSession { lookup, model_key })
    }
}
