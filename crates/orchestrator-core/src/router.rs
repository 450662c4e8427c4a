//! Request router
//!
//! Resolves a style to an engine, runs the engine under a timeout on the
//! single-flight queue, and walks the style's fallback chain on retryable
//! failures. When the whole chain fails the deterministic engine runs once more
//! as a safety net. Router shutdown ends a running task with `Cancelled`
//! without trying further styles.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::StyleEntry;
use common::types::{EngineTarget, ImageBuffer, ProcessingOptions, DETERMINISTIC_ENGINE_ID};
use common::utils::execute_with_deadline;
use config::ConfigManager;
use hardware_profiler::ActiveTier;
use inference_engine::{EngineMetadata, EngineOutput, EngineRegistry, SharedEngine};
use task_scheduler::{ProcessingTask, SingleFlightQueue, TaskProgress, TaskState};

use crate::stats::RunStats;
use crate::styles::{StyleCatalog, SAFETY_NET_STYLE};

/// Router tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterSettings {
    /// Deadline for one engine call
    pub timeout: Duration,
    /// Tasks allowed to wait behind the running one
    pub max_pending: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            max_pending: 64,
        }
    }
}

impl RouterSettings {
    /// Reads `router.timeout_ms` and `queue.max_pending`
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        let defaults = Self::default();
        Self {
            timeout: config_manager
                .get_duration("router.timeout_ms")
                .unwrap_or(defaults.timeout),
            max_pending: config_manager
                .get_usize("queue.max_pending")
                .unwrap_or(defaults.max_pending),
        }
    }
}

/// Outcome of a processed request
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    #[serde(skip)]
    pub image: ImageBuffer,
    /// Engine that produced the image
    pub engine_used: String,
    /// Style that produced the image
    pub style_used: String,
    /// Whether a style other than the requested one produced the image
    pub used_fallback: bool,
    /// Style the caller asked for
    pub original_style: String,
    /// Engine calls made, including failed ones
    pub attempts: usize,
    /// Time from dequeue to result
    pub elapsed: Duration,
    /// Metadata reported by the engine
    pub metadata: EngineMetadata,
}

struct RouterCore {
    styles: Arc<StyleCatalog>,
    registry: Arc<EngineRegistry>,
    active_tier: Arc<ActiveTier>,
    stats: Arc<RunStats>,
    timeout: Duration,
    shutdown: CancellationToken,
}

/// Routes processing requests to engines
pub struct Router {
    core: Arc<RouterCore>,
    queue: SingleFlightQueue<Result<ProcessResult>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("timeout", &self.core.timeout)
            .field("queue", &self.queue)
            .finish()
    }
}

impl Router {
    /// Creates the router and starts its queue worker
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        styles: Arc<StyleCatalog>,
        registry: Arc<EngineRegistry>,
        active_tier: Arc<ActiveTier>,
        stats: Arc<RunStats>,
        settings: RouterSettings,
    ) -> Self {
        info!(
            "Router ready with {} styles, {} engines, {:?} timeout",
            styles.len(),
            registry.len(),
            settings.timeout
        );
        Self {
            core: Arc::new(RouterCore {
                styles,
                registry,
                active_tier,
                stats,
                timeout: settings.timeout,
                shutdown: CancellationToken::new(),
            }),
            queue: SingleFlightQueue::new("router", settings.max_pending),
        }
    }

    /// Processes one image with the named style
    ///
    /// Unknown styles fail immediately with `UnknownStyle` and are never queued.
    pub async fn process(
        &self,
        image: ImageBuffer,
        style: &str,
        options: ProcessingOptions,
    ) -> Result<ProcessResult> {
        let chain: Vec<StyleEntry> = self.core.styles.chain(style)?.into_iter().cloned().collect();

        let core = self.core.clone();
        self.queue
            .submit(style, move |task| async move { core.run(task, image, chain, options).await })
            .await?
    }

    /// Engine id a style resolves to under the current tier
    pub fn resolve_engine(&self, style: &StyleEntry) -> String {
        self.core.resolve_engine(style)
    }

    pub fn stats(&self) -> &Arc<RunStats> {
        &self.core.stats
    }

    pub fn styles(&self) -> &Arc<StyleCatalog> {
        &self.core.styles
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.core.registry
    }

    /// Tasks waiting or running
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Cancels the running attempt and stops the queue
    pub async fn shutdown(&self) {
        self.core.shutdown.cancel();
        self.queue.shutdown().await;
    }
}

impl RouterCore {
    fn resolve_engine(&self, style: &StyleEntry) -> String {
        match &style.engine {
            EngineTarget::Engine(id) => id.clone(),
            EngineTarget::Auto => {
                let preferred = self.active_tier.settings().preferred_engine;
                if self.registry.contains(&preferred) {
                    preferred
                } else {
                    debug!(
                        "Preferred engine '{}' is not registered, '{}' resolves to {}",
                        preferred, style.id, DETERMINISTIC_ENGINE_ID
                    );
                    DETERMINISTIC_ENGINE_ID.to_string()
                }
            }
        }
    }

    async fn attempt(
        &self,
        engine: &SharedEngine,
        image: &ImageBuffer,
        model_id: &str,
        options: &ProcessingOptions,
    ) -> Result<EngineOutput> {
        let token = self.shutdown.child_token();
        let operation = format!("{} on {}", model_id, engine.id());
        execute_with_deadline(engine.process(image, model_id, options, &token), self.timeout, &token, &operation).await
    }

    async fn run(
        &self,
        task: ProcessingTask,
        image: ImageBuffer,
        chain: Vec<StyleEntry>,
        options: ProcessingOptions,
    ) -> Result<ProcessResult> {
        let started = Instant::now();
        let mut progress = TaskProgress::new(task);
        let outcome = self.walk_chain(&mut progress, &image, &chain, &options, started).await;

        match &outcome {
            Ok(result) => {
                self.stats
                    .record_success(&result.engine_used, result.used_fallback, result.elapsed);
                info!(
                    "{} served by '{}' on {} in {:?} ({} attempts{})",
                    progress.task(),
                    result.style_used,
                    result.engine_used,
                    result.elapsed,
                    result.attempts,
                    if result.used_fallback { ", fallback" } else { "" }
                );
            }
            Err(e) => {
                self.stats.record_failure(started.elapsed());
                warn!(error_kind = e.kind(), "{} failed: {}", progress.task(), e);
            }
        }
        outcome
    }

    async fn walk_chain(
        &self,
        progress: &mut TaskProgress,
        image: &ImageBuffer,
        chain: &[StyleEntry],
        options: &ProcessingOptions,
        started: Instant,
    ) -> Result<ProcessResult> {
        let original_style = progress.task().style_id.clone();
        let mut last_error: Option<Error> = None;

        for (hop, style) in chain.iter().enumerate() {
            progress.advance(TaskState::ResolvingEngine)?;
            if self.shutdown.is_cancelled() {
                return self.abandon(progress, None);
            }
            let engine_id = self.resolve_engine(style);
            let engine = match self.registry.require(&engine_id) {
                Ok(engine) => engine,
                Err(e) => {
                    warn!("{}: style '{}' skipped: {}", progress.task(), style.id, e);
                    progress.advance(TaskState::RetryingFallback)?;
                    last_error = Some(e);
                    continue;
                }
            };

            progress.advance(TaskState::AwaitingResult)?;
            match self.attempt(&engine, image, style.model_id(), options).await {
                Ok(output) => {
                    progress.advance(TaskState::Succeeded)?;
                    progress.advance(TaskState::Done)?;
                    return Ok(ProcessResult {
                        image: output.image,
                        engine_used: engine_id,
                        style_used: style.id.clone(),
                        used_fallback: hop > 0,
                        original_style,
                        attempts: progress.attempts(),
                        elapsed: started.elapsed(),
                        metadata: output.metadata,
                    });
                }
                Err(e) if self.shutdown.is_cancelled() => return self.abandon(progress, Some(e)),
                Err(e) if e.is_retryable() => {
                    warn!(
                        error_kind = e.kind(),
                        "{}: style '{}' on {} failed, falling back: {}",
                        progress.task(),
                        style.id,
                        engine_id,
                        e
                    );
                    progress.advance(TaskState::RetryingFallback)?;
                    last_error = Some(e);
                }
                Err(e) => {
                    progress.advance(TaskState::Failed)?;
                    progress.advance(TaskState::Done)?;
                    return Err(e);
                }
            }
        }

        if self.shutdown.is_cancelled() {
            return self.abandon(progress, last_error);
        }
        self.safety_net(progress, image, options, original_style, last_error, started)
            .await
    }

    /// Ends a task interrupted by shutdown
    fn abandon(&self, progress: &mut TaskProgress, cause: Option<Error>) -> Result<ProcessResult> {
        progress.advance(TaskState::Failed)?;
        progress.advance(TaskState::Done)?;
        debug!("{} abandoned on router shutdown", progress.task());
        Err(match cause {
            Some(e @ Error::Cancelled(_)) => e,
            Some(e) => Error::Cancelled(format!("{} stopped by router shutdown after: {}", progress.task(), e)),
            None => Error::Cancelled(format!("{} stopped by router shutdown", progress.task())),
        })
    }

    async fn safety_net(
        &self,
        progress: &mut TaskProgress,
        image: &ImageBuffer,
        options: &ProcessingOptions,
        original_style: String,
        last_error: Option<Error>,
        started: Instant,
    ) -> Result<ProcessResult> {
        warn!("{}: fallback chain exhausted, running safety net", progress.task());
        progress.advance(TaskState::ResolvingEngine)?;

        let outcome = match self.registry.require(DETERMINISTIC_ENGINE_ID) {
            Ok(engine) => {
                progress.advance(TaskState::AwaitingResult)?;
                self.attempt(&engine, image, SAFETY_NET_STYLE, options).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(output) => {
                progress.advance(TaskState::Succeeded)?;
                progress.advance(TaskState::Done)?;
                Ok(ProcessResult {
                    image: output.image,
                    engine_used: DETERMINISTIC_ENGINE_ID.to_string(),
                    style_used: SAFETY_NET_STYLE.to_string(),
                    used_fallback: true,
                    original_style,
                    attempts: progress.attempts(),
                    elapsed: started.elapsed(),
                    metadata: output.metadata,
                })
            }
            Err(e) => {
                progress.advance(TaskState::Failed)?;
                progress.advance(TaskState::Done)?;
                let last_error = last_error.map_or_else(|| e.to_string(), |prev| format!("{}; then {}", prev, e));
                Err(Error::AllFallbacksExhausted {
                    style: original_style,
                    attempts: progress.attempts(),
                    last_error,
                })
            }
        }
    }
}
