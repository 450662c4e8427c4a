//! Adaptive sketch inference orchestrator
//!
//! This module wires every component into one [`SketchOrchestrator`] context:
//! capability detection, tier assignment, the optional startup benchmark, the
//! engine registry, the router and the adaptive monitor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use common::error::Result as CoreResult;
use common::models::{CapabilitySnapshot, Tier};
use common::types::{ImageBuffer, ProcessingOptions, PIPELINE_ENGINE_ID, TENSOR_ENGINE_ID};
use config::{default_catalog, Catalog, CatalogValidator, ConfigManager};
use hardware_profiler::{
    ActiveTier, Benchmark, BenchmarkResult, CapabilityProbe, ScoringConstants, TierAssigner,
    TierCatalog, TierTransition, TransitionReason,
};
use inference_engine::{
    BuiltinArtifacts, DeterministicEngine, EngineCapabilities, EngineContext, EngineRegistry,
    PipelineEngine, SharedEngine, TensorGraphEngine,
};
use model_manager::{ArtifactFetcher, ArtifactSource, CacheUsage, DownloadProgress, ModelCatalog};
use orchestrator_core::{ProcessResult, Router, RouterSettings, RunStats, RunStatsSnapshot, StyleCatalog};
use resource_manager::{SharedPressureSource, SystemMemoryMonitor};
use scaling_adapter::{apply_tier_budgets, AdaptiveMonitor, MonitorHandle, MonitorSettings};

pub use common::error::Error;

/// How long `shutdown` waits for the monitor loops
const MONITOR_GRACE: Duration = Duration::from_secs(5);

/// Point-in-time view of the whole orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub tier: Tier,
    pub capabilities: CapabilitySnapshot,
    pub engines: Vec<EngineCapabilities>,
    pub caches: Vec<CacheUsage>,
    pub stats: RunStatsSnapshot,
    pub transitions: Vec<TierTransition>,
    pub pending: usize,
    pub monitoring: bool,
}

/// Builder for [`SketchOrchestrator`]
///
/// Everything not set explicitly comes from configuration or the host.
pub struct OrchestratorBuilder {
    config_manager: Arc<ConfigManager>,
    catalog: Option<Catalog>,
    snapshot: Option<CapabilitySnapshot>,
    memory: Option<SharedPressureSource>,
    artifacts: Option<Arc<dyn ArtifactSource>>,
    engines: Vec<SharedEngine>,
    run_benchmark: Option<bool>,
}

impl OrchestratorBuilder {
    pub fn new(config_manager: Arc<ConfigManager>) -> Self {
        Self {
            config_manager,
            catalog: None,
            snapshot: None,
            memory: None,
            artifacts: None,
            engines: Vec::new(),
            run_benchmark: None,
        }
    }

    /// Uses this catalog instead of `catalog.path` or the built-in one
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Skips detection and assigns the tier from this snapshot
    pub fn capabilities(mut self, snapshot: CapabilitySnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Memory reading used by the adaptive monitor
    pub fn memory_source(mut self, source: SharedPressureSource) -> Self {
        self.memory = Some(source);
        self
    }

    /// Source for `builtin://` artifacts
    pub fn builtin_artifacts(mut self, source: Arc<dyn ArtifactSource>) -> Self {
        self.artifacts = Some(source);
        self
    }

    /// Registers an engine, replacing the built-in engine with the same id
    pub fn engine(mut self, engine: SharedEngine) -> Self {
        self.engines.push(engine);
        self
    }

    /// Overrides `benchmark.on_startup`
    pub fn benchmark_on_startup(mut self, enabled: bool) -> Self {
        self.run_benchmark = Some(enabled);
        self
    }

    pub async fn build(self) -> Result<SketchOrchestrator> {
        SketchOrchestrator::build(self).await
    }
}

/// The orchestrator context; build once and share
pub struct SketchOrchestrator {
    /// Configuration manager
    config_manager: Arc<ConfigManager>,

    /// Validated catalog
    catalog: Catalog,

    /// Capabilities the tier was assigned from
    snapshot: CapabilitySnapshot,

    /// Current tier
    active_tier: Arc<ActiveTier>,

    /// Registered engines
    registry: Arc<EngineRegistry>,

    /// Artifact fetcher shared by model-backed engines
    fetcher: Arc<ArtifactFetcher>,

    /// Style router
    router: Router,

    /// Run statistics
    stats: Arc<RunStats>,

    /// Adaptive monitor
    monitor: Arc<AdaptiveMonitor>,

    /// Running monitor loops
    monitor_handle: Mutex<Option<MonitorHandle>>,

    /// Benchmark thresholds
    scoring: ScoringConstants,
}

impl std::fmt::Debug for SketchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SketchOrchestrator")
            .field("tier", &self.active_tier.current_id())
            .field("engines", &self.registry.ids())
            .finish()
    }
}

impl SketchOrchestrator {
    /// Builds the orchestrator entirely from configuration
    pub async fn new(config_manager: Arc<ConfigManager>) -> Result<Self> {
        Self::builder(config_manager).build().await
    }

    pub fn builder(config_manager: Arc<ConfigManager>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config_manager)
    }

    async fn build(builder: OrchestratorBuilder) -> Result<Self> {
        info!("Initializing sketch orchestrator");
        let config_manager = builder.config_manager;

        let catalog = match builder.catalog {
            Some(catalog) => catalog,
            None => load_catalog(&config_manager)?,
        };

        let mut known_engines = vec![TENSOR_ENGINE_ID.to_string(), PIPELINE_ENGINE_ID.to_string()];
        known_engines.extend(builder.engines.iter().map(|e| e.id().to_string()));
        CatalogValidator::new(known_engines)
            .validate(&catalog)
            .context("catalog validation failed")?;
        debug!(
            "Catalog has {} tiers, {} styles, {} models",
            catalog.tiers.len(),
            catalog.styles.len(),
            catalog.models.len()
        );

        let snapshot = match builder.snapshot {
            Some(snapshot) => snapshot,
            None => CapabilityProbe::new(config_manager.clone()).detect(),
        };

        let tiers = Arc::new(TierCatalog::new(catalog.tiers.clone())?);
        let assigner = TierAssigner::new(tiers.clone());
        let initial = assigner.assign(&snapshot).clone();
        info!("Assigned tier '{}' ({})", initial.id, initial.name);
        let active_tier = Arc::new(ActiveTier::new(tiers, &initial));

        let artifacts = builder
            .artifacts
            .unwrap_or_else(|| Arc::new(BuiltinArtifacts::new()));
        let fetcher = Arc::new(ArtifactFetcher::new(&config_manager)?.with_builtin_source(artifacts));

        let context = EngineContext {
            snapshot: snapshot.clone(),
            active_tier: active_tier.clone(),
            models: ModelCatalog::new(catalog.models.clone()),
            fetcher: fetcher.clone(),
        };

        let registry = Arc::new(EngineRegistry::new());
        register_engines(&registry, &context, builder.engines).await;
        apply_tier_budgets(&registry, &initial);

        let stats = Arc::new(RunStats::from_config(&config_manager));
        let styles = Arc::new(StyleCatalog::new(catalog.styles.clone())?);
        let router = Router::new(
            styles,
            registry.clone(),
            active_tier.clone(),
            stats.clone(),
            RouterSettings::from_config(&config_manager),
        );

        let memory = builder
            .memory
            .unwrap_or_else(|| Arc::new(SystemMemoryMonitor::new()));
        let monitor = Arc::new(AdaptiveMonitor::new(
            active_tier.clone(),
            registry.clone(),
            stats.clone(),
            memory,
            MonitorSettings::from_config(&config_manager)?,
        ));

        let orchestrator = Self {
            scoring: ScoringConstants::from_config(&config_manager),
            config_manager,
            catalog,
            snapshot,
            active_tier,
            registry,
            fetcher,
            router,
            stats,
            monitor,
            monitor_handle: Mutex::new(None),
        };

        let run_benchmark = builder.run_benchmark.unwrap_or_else(|| {
            orchestrator
                .config_manager
                .get_bool("benchmark.on_startup")
                .unwrap_or(false)
        });
        if run_benchmark {
            orchestrator.run_benchmark().await?;
        }

        info!(
            "Sketch orchestrator ready: tier '{}', engines {:?}",
            orchestrator.active_tier.current_id(),
            orchestrator.registry.ids()
        );

        Ok(orchestrator)
    }

    /// Processes one image with the given style
    pub async fn process(
        &self,
        image: ImageBuffer,
        style: &str,
        options: ProcessingOptions,
    ) -> CoreResult<ProcessResult> {
        self.router.process(image, style, options).await
    }

    /// Runs the benchmark and applies its recommendation
    pub async fn run_benchmark(&self) -> Result<BenchmarkResult> {
        let current = self.active_tier.current_id();
        let benchmark = Arc::new(Benchmark::new(self.active_tier.catalog().clone(), self.scoring.clone()));
        let result = benchmark
            .run_blocking(self.snapshot.clone(), current.clone())
            .await?;

        if result.recommended_tier_id != current {
            if let Some(tier) = self
                .active_tier
                .switch_to(&result.recommended_tier_id, TransitionReason::Benchmark)?
            {
                let evicted = apply_tier_budgets(&self.registry, &tier);
                info!(
                    "Benchmark moved tier '{}' -> '{}' ({} sessions evicted)",
                    current, tier.id, evicted
                );
            }
        }

        Ok(result)
    }

    /// Starts the adaptive monitor; returns false if it is already running
    pub fn start_monitoring(&self) -> bool {
        let mut handle = self.monitor_handle.lock();
        if handle.as_ref().map_or(false, |h| h.is_running()) {
            return false;
        }
        *handle = Some(self.monitor.start_monitoring());
        true
    }

    /// Stops the adaptive monitor and waits for its loops
    pub async fn stop_monitoring(&self) {
        let handle = self.monitor_handle.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor_handle
            .lock()
            .as_ref()
            .map_or(false, |h| h.is_running())
    }

    /// Stops the monitor, cancels the running task and closes the queue
    pub async fn shutdown(&self) {
        info!("Shutting down sketch orchestrator");
        let handle = self.monitor_handle.lock().take();
        if let Some(handle) = handle {
            if !handle.stop_within(MONITOR_GRACE).await {
                warn!("Monitor loops did not stop within {:?}", MONITOR_GRACE);
            }
        }
        self.router.shutdown().await;
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            tier: self.active_tier.current(),
            capabilities: self.snapshot.clone(),
            engines: self.registry.capabilities(),
            caches: self.registry.caches().iter().map(|c| c.usage()).collect(),
            stats: self.stats.snapshot(),
            transitions: self.active_tier.transitions(),
            pending: self.router.pending(),
            monitoring: self.is_monitoring(),
        }
    }

    pub fn capabilities(&self) -> &CapabilitySnapshot {
        &self.snapshot
    }

    pub fn current_tier(&self) -> Tier {
        self.active_tier.current()
    }

    pub fn active_tier(&self) -> &Arc<ActiveTier> {
        &self.active_tier
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn styles(&self) -> &Arc<StyleCatalog> {
        self.router.styles()
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> RunStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn monitor(&self) -> &Arc<AdaptiveMonitor> {
        &self.monitor
    }

    pub fn download_progress(&self) -> Vec<DownloadProgress> {
        self.fetcher.all_progress()
    }

    pub fn config(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }
}

/// Loads `catalog.path` when set, the built-in catalog otherwise
pub fn load_catalog(config_manager: &ConfigManager) -> Result<Catalog> {
    match config_manager.get_path("catalog.path") {
        Ok(path) => {
            info!("Loading catalog from {}", path.display());
            Catalog::load(&path).with_context(|| format!("failed to load catalog {}", path.display()))
        }
        Err(_) => Ok(default_catalog()),
    }
}

/// Registers the built-in engines, letting `overrides` replace them by id
async fn register_engines(registry: &EngineRegistry, context: &EngineContext, overrides: Vec<SharedEngine>) {
    let builtin: Vec<SharedEngine> = vec![
        Arc::new(TensorGraphEngine::new(context.clone())),
        Arc::new(PipelineEngine::new(context.clone())),
        Arc::new(DeterministicEngine::new()),
    ];

    let mut engines: Vec<SharedEngine> = builtin
        .into_iter()
        .filter(|engine| !overrides.iter().any(|o| o.id() == engine.id()))
        .collect();
    engines.extend(overrides);

    for engine in engines {
        let id = engine.id().to_string();
        if !registry.register(engine).await {
            warn!("Engine '{}' is unavailable on this host", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use common::types::{ConnectionClass, QualityLevel, DETERMINISTIC_ENGINE_ID};
    use inference_engine::{EngineAdapter, EngineOutput};
    use model_manager::{CacheBudget, LoadedSession, ModelCache};
    use resource_manager::ManualPressureSource;

    fn config() -> Arc<ConfigManager> {
        Arc::new(ConfigManager::with_overrides(Vec::<(String, String)>::new()).unwrap())
    }

    fn desktop_accelerated() -> CapabilitySnapshot {
        CapabilitySnapshot {
            accelerated_gpu: true,
            intermediate_gpu: true,
            portable_compute: true,
            memory_gb: 8.0,
            cores: 8,
            is_mobile: false,
            connection: ConnectionClass::Broadband,
            battery_level: None,
        }
    }

    fn portable_only() -> CapabilitySnapshot {
        CapabilitySnapshot {
            accelerated_gpu: false,
            intermediate_gpu: false,
            portable_compute: true,
            memory_gb: 1.0,
            cores: 2,
            is_mobile: true,
            connection: ConnectionClass::Unknown,
            battery_level: Some(0.8),
        }
    }

    fn test_image(side: u32) -> ImageBuffer {
        let mut pixels = Vec::with_capacity((side * side * 4) as usize);
        for y in 0..side {
            for x in 0..side {
                let value = if x < side / 2 { 30 } else { 220 };
                let value = value.max((y * 2) as u8);
                pixels.extend_from_slice(&[value, value, value, 255]);
            }
        }
        ImageBuffer::new(side, side, pixels).unwrap()
    }

    async fn build(snapshot: CapabilitySnapshot) -> SketchOrchestrator {
        SketchOrchestrator::builder(config())
            .capabilities(snapshot)
            .memory_source(Arc::new(ManualPressureSource::new(20.0)))
            .build()
            .await
            .unwrap()
    }

    /// Engine that initializes but rejects every request
    struct RejectingEngine {
        id: &'static str,
        calls: AtomicUsize,
    }

    impl RejectingEngine {
        fn new(id: &'static str) -> Arc<Self> {
            Arc::new(Self { id, calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl EngineAdapter for RejectingEngine {
        fn id(&self) -> &str {
            self.id
        }

        async fn initialize(&self) -> CoreResult<()> {
            Ok(())
        }

        async fn process(
            &self,
            _image: &ImageBuffer,
            model_id: &str,
            _options: &ProcessingOptions,
            _cancel: &CancellationToken,
        ) -> CoreResult<EngineOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Inference(format!("{} rejects '{}'", self.id, model_id)))
        }

        fn capabilities(&self) -> EngineCapabilities {
            EngineCapabilities {
                engine: self.id.to_string(),
                backend: None,
                model_ids: Vec::new(),
                uses_models: false,
            }
        }
    }

    #[tokio::test]
    async fn test_accelerated_desktop_gets_strongest_tier() {
        let config = Arc::new(
            ConfigManager::with_overrides([
                ("probe.accelerated_gpu", "true"),
                ("probe.memory_gb", "8"),
                ("probe.cores", "8"),
                ("probe.is_mobile", "false"),
            ])
            .unwrap(),
        );
        let orchestrator = SketchOrchestrator::builder(config)
            .memory_source(Arc::new(ManualPressureSource::new(20.0)))
            .build()
            .await
            .unwrap();

        assert_eq!(orchestrator.current_tier().id, "ultra");
        assert!(orchestrator.capabilities().accelerated_gpu);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_portable_host_gets_portable_tier() {
        let orchestrator = build(portable_only()).await;

        let tier = orchestrator.current_tier();
        assert_eq!(tier.id, "portable");
        assert_eq!(tier.budget.quality_level, QualityLevel::Low);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_primary_falls_back_to_deterministic() {
        let tensor = RejectingEngine::new(TENSOR_ENGINE_ID);
        let pipeline = RejectingEngine::new(PIPELINE_ENGINE_ID);
        let orchestrator = SketchOrchestrator::builder(config())
            .capabilities(desktop_accelerated())
            .memory_source(Arc::new(ManualPressureSource::new(20.0)))
            .engine(tensor.clone())
            .engine(pipeline.clone())
            .build()
            .await
            .unwrap();

        let result = orchestrator
            .process(test_image(16), "ai_sketch", ProcessingOptions::default())
            .await
            .unwrap();

        assert!(result.used_fallback);
        assert_eq!(result.original_style, "ai_sketch");
        assert_eq!(result.engine_used, DETERMINISTIC_ENGINE_ID);
        assert_eq!(result.style_used, "pencil");
        assert_eq!(tensor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);

        let stats = orchestrator.stats();
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.fallback_used, 1);
        assert_eq!(stats.per_engine_usage.get(DETERMINISTIC_ENGINE_ID), Some(&1));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_sixth_model_evicts_least_recently_used() {
        let cache: ModelCache<String> = ModelCache::new("test", CacheBudget::new(5, 1 << 30));
        let names = ["a", "b", "c", "d", "e"];
        for name in names {
            cache
                .get_or_load(name, QualityLevel::Low, || async move {
                    Ok(LoadedSession { session: name.to_string(), size_bytes: 1024 })
                })
                .await
                .unwrap();
        }

        // "b" becomes the least recently used once "a" is touched again
        let hit = cache
            .get_or_load("a", QualityLevel::Low, || async {
                Err(Error::Internal("should be cached".to_string()))
            })
            .await
            .unwrap();
        assert!(hit.cache_hit);

        cache
            .get_or_load("f", QualityLevel::Low, || async {
                Ok(LoadedSession { session: "f".to_string(), size_bytes: 1024 })
            })
            .await
            .unwrap();

        let usage = cache.usage();
        assert_eq!(usage.entries, 5);
        assert_eq!(usage.evictions, 1);
        assert!(!cache.contains("b", QualityLevel::Low));
        for name in ["a", "c", "d", "e", "f"] {
            assert!(cache.contains(name, QualityLevel::Low), "{} was evicted", name);
        }
    }

    #[tokio::test]
    async fn test_builtin_engines_end_to_end() {
        let orchestrator = build(desktop_accelerated()).await;
        let mut engines = orchestrator.registry().ids();
        engines.sort();
        assert_eq!(engines, vec!["deterministic", "pipeline", "tensor"]);

        let image = test_image(24);
        let result = orchestrator
            .process(image.clone(), "ai_sketch", ProcessingOptions::default())
            .await
            .unwrap();
        assert_eq!(result.engine_used, TENSOR_ENGINE_ID);
        assert!(!result.used_fallback);
        assert_eq!(result.image.width(), 24);
        assert_eq!(result.image.height(), 24);
        assert_eq!(result.metadata.model_key.as_deref(), Some("edge_net@ultra"));

        let result = orchestrator
            .process(image.clone(), "ink_wash", ProcessingOptions::default())
            .await
            .unwrap();
        assert_eq!(result.engine_used, PIPELINE_ENGINE_ID);

        let result = orchestrator
            .process(image, "outline", ProcessingOptions::default())
            .await
            .unwrap();
        assert_eq!(result.engine_used, DETERMINISTIC_ENGINE_ID);
        assert!(!result.used_fallback);

        let status = orchestrator.status();
        assert_eq!(status.stats.total_processed, 3);
        assert_eq!(status.stats.successful_primary, 3);
        assert!(status.caches.iter().any(|c| c.entries > 0));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_style_is_rejected_before_queueing() {
        let orchestrator = build(portable_only()).await;

        let outcome = orchestrator
            .process(test_image(8), "watercolor", ProcessingOptions::default())
            .await;
        assert!(matches!(outcome, Err(Error::UnknownStyle(_))));
        assert_eq!(orchestrator.stats().total_processed, 0);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_monitoring_starts_once_and_stops() {
        let orchestrator = build(portable_only()).await;

        assert!(orchestrator.start_monitoring());
        assert!(!orchestrator.start_monitoring());
        assert!(orchestrator.is_monitoring());

        tokio::time::timeout(Duration::from_secs(5), orchestrator.stop_monitoring())
            .await
            .unwrap();
        assert!(!orchestrator.is_monitoring());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_benchmark_recommendation_becomes_active_tier() {
        let config = Arc::new(
            ConfigManager::with_overrides([
                ("benchmark.surface_iterations", "4"),
                ("benchmark.compute_iterations", "2"),
                ("benchmark.accelerated_iterations", "2"),
                ("benchmark.allocation_window_ms", "5"),
            ])
            .unwrap(),
        );
        let orchestrator = SketchOrchestrator::builder(config)
            .capabilities(portable_only())
            .memory_source(Arc::new(ManualPressureSource::new(20.0)))
            .build()
            .await
            .unwrap();

        let result = orchestrator.run_benchmark().await.unwrap();
        assert!((0.0..=100.0).contains(&result.average_score));
        for score in result.per_test_score.values() {
            assert!((0.0..=100.0).contains(score));
        }
        assert_eq!(orchestrator.current_tier().id, result.recommended_tier_id);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_catalog_loaded_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let mut catalog = default_catalog();
        catalog.styles.retain(|s| s.id != "anime_lines");
        std::fs::write(&path, serde_json::to_vec_pretty(&catalog).unwrap()).unwrap();

        let config = Arc::new(
            ConfigManager::with_overrides([("catalog.path", path.to_string_lossy().to_string())]).unwrap(),
        );
        let orchestrator = SketchOrchestrator::builder(config)
            .capabilities(portable_only())
            .memory_source(Arc::new(ManualPressureSource::new(20.0)))
            .build()
            .await
            .unwrap();
        assert!(orchestrator.styles().get("anime_lines").is_none());
        assert_eq!(orchestrator.styles().len(), catalog.styles.len());
        orchestrator.shutdown().await;

        // A fallback to a style that no longer exists is rejected at startup
        catalog.styles.retain(|s| s.id != "pencil_pipeline");
        std::fs::write(&path, serde_json::to_vec_pretty(&catalog).unwrap()).unwrap();
        let config = Arc::new(
            ConfigManager::with_overrides([("catalog.path", path.to_string_lossy().to_string())]).unwrap(),
        );
        let outcome = SketchOrchestrator::builder(config)
            .capabilities(portable_only())
            .build()
            .await;
        assert!(outcome.is_err());
    }
}
