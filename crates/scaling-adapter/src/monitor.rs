//! Adaptive monitor
//!
//! Two background loops adjust the orchestrator to the host. The latency loop
//! moves the active tier when the rolling average leaves the configured band.
//! The memory loop shrinks or clears engine caches under pressure and puts the
//! tier budget back once it eases. A shrunk budget is always derived from the
//! active tier, so repeated ticks at the same level leave it unchanged. Budget
//! changes only constrain future insertions beyond the evictions they trigger.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::models::Tier;
use hardware_profiler::{ActiveTier, TransitionReason};
use inference_engine::EngineRegistry;
use model_manager::CacheBudget;
use orchestrator_core::RunStats;
use resource_manager::{PressureLevel, SharedPressureSource};

use crate::policy::{memory_action, LatencyDecision, LatencyPolicy, MemoryAction, MonitorSettings};

/// Applies a tier's cache budget to every engine cache; returns sessions evicted
pub fn apply_tier_budgets(registry: &EngineRegistry, tier: &Tier) -> usize {
    let budget = CacheBudget::from(&tier.budget);
    let evicted: usize = registry
        .caches()
        .iter()
        .map(|cache| cache.set_budget(budget))
        .sum();
    info!(
        "Applied '{}' budget of {} models to engine caches ({} evicted)",
        tier.id, budget.max_models, evicted
    );
    evicted
}

/// Watches latency and memory pressure and adapts tier and caches
pub struct AdaptiveMonitor {
    active_tier: Arc<ActiveTier>,
    registry: Arc<EngineRegistry>,
    stats: Arc<RunStats>,
    memory: SharedPressureSource,
    settings: MonitorSettings,
    /// Pressure level seen by the previous memory tick
    last_pressure: Mutex<PressureLevel>,
}

impl std::fmt::Debug for AdaptiveMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveMonitor")
            .field("tier", &self.active_tier.current_id())
            .field("settings", &self.settings)
            .field("last_pressure", &*self.last_pressure.lock())
            .finish()
    }
}

impl AdaptiveMonitor {
    pub fn new(
        active_tier: Arc<ActiveTier>,
        registry: Arc<EngineRegistry>,
        stats: Arc<RunStats>,
        memory: SharedPressureSource,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            active_tier,
            registry,
            stats,
            memory,
            settings,
            last_pressure: Mutex::new(PressureLevel::Normal),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Starts both loops; stop them through the returned handle
    pub fn start_monitoring(self: &Arc<Self>) -> MonitorHandle {
        let token = CancellationToken::new();
        info!(
            "Starting adaptive monitor (latency every {:?}, memory every {:?})",
            self.settings.latency_interval, self.settings.memory_interval
        );

        let latency = {
            let monitor = self.clone();
            let token = token.clone();
            tokio::spawn(async move { monitor.latency_loop(token).await })
        };
        let memory = {
            let monitor = self.clone();
            let token = token.clone();
            tokio::spawn(async move { monitor.memory_loop(token).await })
        };

        MonitorHandle {
            token,
            tasks: vec![latency, memory],
        }
    }

    async fn latency_loop(&self, token: CancellationToken) {
        let mut policy = self.settings.latency_policy();
        let mut ticker = interval(self.settings.latency_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.latency_tick(&mut policy);
                }
            }
        }
        debug!("Latency loop stopped");
    }

    async fn memory_loop(&self, token: CancellationToken) {
        let mut ticker = interval(self.settings.memory_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.memory_tick();
                }
            }
        }
        debug!("Memory loop stopped");
    }

    /// One latency evaluation; applies any tier change it decides on
    pub fn latency_tick(&self, policy: &mut LatencyPolicy) -> LatencyDecision {
        let average = self.stats.rolling_average_latency();
        let current = self.active_tier.current_id();
        let can_upgrade = self.active_tier.catalog().next_stronger(&current).is_some();

        let decision = policy.observe(average, can_upgrade);
        let changed = match decision {
            LatencyDecision::Hold => None,
            LatencyDecision::Downgrade => self.active_tier.downgrade(TransitionReason::Latency),
            LatencyDecision::Upgrade => self.active_tier.upgrade(TransitionReason::Latency),
        };

        match changed {
            Some(tier) => {
                info!(
                    "Rolling latency {:?} moved tier from '{}' to '{}'",
                    average.unwrap_or_default(),
                    current,
                    tier.id
                );
                apply_tier_budgets(&self.registry, &tier);
                // Samples from the old tier would skew the next decision.
                self.stats.clear_latencies();
            }
            None if decision == LatencyDecision::Downgrade => {
                warn!("Latency is high but '{}' is already the weakest tier", current);
            }
            None => {}
        }
        decision
    }

    /// One memory evaluation; applies the resulting cache action
    pub fn memory_tick(&self) -> MemoryAction {
        let Some((reading, level)) = self.settings.thresholds.evaluate(self.memory.as_ref()) else {
            return MemoryAction::None;
        };

        let previous = std::mem::replace(&mut *self.last_pressure.lock(), level);
        let action = memory_action(previous, level, self.settings.shrink_factor);
        match action {
            MemoryAction::None => {}
            MemoryAction::Shrink(factor) => {
                let tier = self.active_tier.current();
                let budget = CacheBudget::from(&tier.budget).scaled(factor);
                let evicted: usize = self
                    .registry
                    .caches()
                    .iter()
                    .map(|cache| cache.set_budget(budget))
                    .sum();
                if previous != level || evicted > 0 {
                    warn!(
                        "Memory at {:.1}%, held engine caches at {} of the '{}' budget ({} evicted)",
                        reading.usage_percent(),
                        factor,
                        tier.id,
                        evicted
                    );
                }
            }
            MemoryAction::Clear => {
                let cleared = self.registry.clear_all_caches();
                warn!(
                    "Memory at {:.1}% is critical, cleared {} cached sessions",
                    reading.usage_percent(),
                    cleared
                );
            }
            MemoryAction::Restore => {
                info!("Memory back to {:.1}%, restoring cache budgets", reading.usage_percent());
                apply_tier_budgets(&self.registry, &self.active_tier.current());
            }
        }
        action
    }
}

/// Running monitor loops
#[derive(Debug)]
pub struct MonitorHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Stops both loops and waits for them to finish
    pub async fn stop(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Monitor loop ended abnormally: {}", e);
            }
        }
        info!("Adaptive monitor stopped");
    }

    /// Waits at most `grace` for the loops after cancelling them
    pub async fn stop_within(self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.stop()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use common::error::{Error, Result};
    use common::types::{ImageBuffer, ProcessingOptions, QualityLevel};
    use config::default_catalog;
    use hardware_profiler::TierCatalog;
    use inference_engine::{EngineAdapter, EngineCapabilities, EngineOutput};
    use model_manager::{CacheControl, LoadedSession, ModelCache};
    use resource_manager::ManualPressureSource;

    struct CachingEngine {
        cache: Arc<ModelCache<u32>>,
    }

    #[async_trait]
    impl EngineAdapter for CachingEngine {
        fn id(&self) -> &str {
            "caching"
        }

        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn process(
            &self,
            _image: &ImageBuffer,
            _model_id: &str,
            _options: &ProcessingOptions,
            _cancel: &CancellationToken,
        ) -> Result<EngineOutput> {
            Err(Error::Inference("not used".into()))
        }

        fn capabilities(&self) -> EngineCapabilities {
            EngineCapabilities {
                engine: "caching".into(),
                backend: None,
                model_ids: Vec::new(),
                uses_models: true,
            }
        }

        fn cache_control(&self) -> Option<Arc<dyn CacheControl>> {
            Some(self.cache.clone())
        }
    }

    struct Fixture {
        monitor: Arc<AdaptiveMonitor>,
        cache: Arc<ModelCache<u32>>,
        stats: Arc<RunStats>,
        memory: Arc<ManualPressureSource>,
        active_tier: Arc<ActiveTier>,
    }

    async fn fixture(tier: &str, settings: MonitorSettings) -> Fixture {
        let tiers = Arc::new(TierCatalog::new(default_catalog().tiers).unwrap());
        let active_tier = Arc::new(ActiveTier::new(tiers.clone(), tiers.get(tier).unwrap()));
        let cache = Arc::new(ModelCache::new("caching", CacheBudget::new(4, 1_000)));
        let registry = Arc::new(EngineRegistry::new());
        registry.register(Arc::new(CachingEngine { cache: cache.clone() })).await;

        let stats = Arc::new(RunStats::new(5));
        let memory = Arc::new(ManualPressureSource::new(10.0));
        let monitor = Arc::new(AdaptiveMonitor::new(
            active_tier.clone(),
            registry,
            stats.clone(),
            memory.clone(),
            settings,
        ));
        Fixture { monitor, cache, stats, memory, active_tier }
    }

    async fn fill(cache: &ModelCache<u32>, count: usize) {
        let levels = QualityLevel::ALL;
        for i in 0..count {
            cache
                .get_or_load(&format!("m{}", i), levels[i % levels.len()], || async move {
                    Ok(LoadedSession { session: i as u32, size_bytes: 10 })
                })
                .await
                .unwrap();
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            latency_interval: Duration::from_millis(10),
            memory_interval: Duration::from_millis(10),
            latency_high_water: Duration::from_millis(500),
            latency_low_water: Duration::from_millis(50),
            upgrade_after_samples: 2,
            ..MonitorSettings::default()
        }
    }

    #[tokio::test]
    async fn test_high_latency_downgrades_and_applies_budget() {
        let f = fixture("high", settings()).await;
        fill(&f.cache, 4).await;
        f.stats.record_success("tensor", false, Duration::from_secs(2));

        let mut policy = f.monitor.settings().latency_policy();
        assert_eq!(f.monitor.latency_tick(&mut policy), LatencyDecision::Downgrade);
        assert_eq!(f.active_tier.current_id(), "standard");

        // The standard tier allows three models.
        assert_eq!(f.cache.usage().entries, 3);
        assert_eq!(f.cache.budget().max_models, 3);
        assert_eq!(f.stats.rolling_average_latency(), None);
    }

    #[tokio::test]
    async fn test_low_latency_upgrades_after_streak() {
        let f = fixture("standard", settings()).await;
        let mut policy = f.monitor.settings().latency_policy();

        f.stats.record_success("tensor", false, Duration::from_millis(5));
        assert_eq!(f.monitor.latency_tick(&mut policy), LatencyDecision::Hold);
        assert_eq!(f.monitor.latency_tick(&mut policy), LatencyDecision::Upgrade);
        assert_eq!(f.active_tier.current_id(), "high");
        assert_eq!(f.cache.budget().max_models, 4);
    }

    #[tokio::test]
    async fn test_memory_pressure_shrinks_then_clears() {
        let f = fixture("high", settings()).await;
        fill(&f.cache, 4).await;

        assert_eq!(f.monitor.memory_tick(), MemoryAction::None);

        f.memory.set_percent(80.0);
        assert_eq!(f.monitor.memory_tick(), MemoryAction::Shrink(0.5));
        assert_eq!(f.cache.usage().entries, 2);

        f.memory.set_percent(95.0);
        assert_eq!(f.monitor.memory_tick(), MemoryAction::Clear);
        assert_eq!(f.cache.usage().entries, 0);
    }

    #[tokio::test]
    async fn test_sustained_pressure_holds_budget_then_restores() {
        let f = fixture("high", settings()).await;
        fill(&f.cache, 4).await;
        let tier_budget = CacheBudget::from(&f.active_tier.current().budget);
        let shrunk = tier_budget.scaled(0.5);

        f.memory.set_percent(80.0);
        for _ in 0..4 {
            assert_eq!(f.monitor.memory_tick(), MemoryAction::Shrink(0.5));
            assert_eq!(f.cache.budget(), shrunk);
        }
        assert_eq!(f.cache.usage().entries, 2);

        f.memory.set_percent(20.0);
        assert_eq!(f.monitor.memory_tick(), MemoryAction::Restore);
        assert_eq!(f.cache.budget(), tier_budget);
        for _ in 0..10 {
            assert_eq!(f.monitor.memory_tick(), MemoryAction::None);
        }
        assert_eq!(f.cache.budget(), tier_budget);

        // Room is back: four sessions fit again.
        fill(&f.cache, 4).await;
        assert_eq!(f.cache.usage().entries, 4);
    }

    #[tokio::test]
    async fn test_shrink_follows_current_tier() {
        let f = fixture("high", settings()).await;
        f.memory.set_percent(80.0);
        f.monitor.memory_tick();
        assert_eq!(f.cache.budget().max_models, 2);

        f.active_tier.switch_to("minimal", TransitionReason::Manual).unwrap();
        f.monitor.memory_tick();
        let minimal = CacheBudget::from(&f.active_tier.current().budget);
        assert_eq!(f.cache.budget(), minimal.scaled(0.5));

        f.memory.set_percent(20.0);
        assert_eq!(f.monitor.memory_tick(), MemoryAction::Restore);
        assert_eq!(f.cache.budget(), minimal);
    }

    #[tokio::test]
    async fn test_unavailable_pressure_is_ignored() {
        let tiers = Arc::new(TierCatalog::new(default_catalog().tiers).unwrap());
        let monitor = AdaptiveMonitor::new(
            Arc::new(ActiveTier::new(tiers.clone(), tiers.weakest())),
            Arc::new(EngineRegistry::new()),
            Arc::new(RunStats::default()),
            Arc::new(ManualPressureSource::unavailable()),
            settings(),
        );
        assert_eq!(monitor.memory_tick(), MemoryAction::None);
    }

    #[tokio::test]
    async fn test_loops_run_and_stop() {
        let f = fixture("high", settings()).await;
        fill(&f.cache, 2).await;
        f.memory.set_percent(99.0);

        let handle = f.monitor.start_monitoring();
        assert!(handle.is_running());

        let mut waited = 0;
        while f.cache.usage().entries > 0 && waited < 200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            waited += 1;
        }
        assert_eq!(f.cache.usage().entries, 0);

        assert!(handle.stop_within(Duration::from_secs(1)).await);
    }
}
