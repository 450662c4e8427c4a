//! Engine contract
//!
//! Every processing engine, model-backed or not, implements [`EngineAdapter`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use common::error::Result;
use common::types::{ImageBuffer, ProcessingOptions};
use model_manager::CacheControl;

use crate::backend::ExecutionBackend;

/// Metadata attached to every engine result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMetadata {
    /// Engine id
    pub engine: String,
    /// Execution backend that ran the work
    pub backend: ExecutionBackend,
    /// Cache key of the model used, if any
    pub model_key: Option<String>,
    /// Whether the model session came from the cache
    pub cache_hit: bool,
    /// Time spent processing, excluding queueing
    pub inference_time: Duration,
}

/// Engine result
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub image: ImageBuffer,
    pub metadata: EngineMetadata,
}

/// Static description of an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    pub engine: String,
    /// Backend resolved at initialization, if initialized
    pub backend: Option<ExecutionBackend>,
    /// Model ids the engine accepts
    pub model_ids: Vec<String>,
    /// Whether the engine loads models
    pub uses_models: bool,
}

/// A processing engine
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Stable engine id
    fn id(&self) -> &str;

    /// Prepares the engine; engines that fail here are not registered
    async fn initialize(&self) -> Result<()>;

    /// Processes one image with the given model id
    ///
    /// Implementations check `cancel` between stages and stop early once it fires.
    async fn process(
        &self,
        image: &ImageBuffer,
        model_id: &str,
        options: &ProcessingOptions,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput>;

    fn capabilities(&self) -> EngineCapabilities;

    /// Drops every cached model session; returns the number dropped
    fn clear_cache(&self) -> usize {
        self.cache_control().map_or(0, |cache| cache.clear())
    }

    /// Cache control for engines that cache model sessions
    fn cache_control(&self) -> Option<Arc<dyn CacheControl>> {
        None
    }
}
