//! Run statistics
//!
//! Updated exactly once per completed task. The rolling latency average covers
//! the most recent `stats.latency_window` tasks and feeds the adaptive monitor.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use config::ConfigManager;

/// Point-in-time copy of the statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatsSnapshot {
    /// Tasks completed, successful or not
    pub total_processed: u64,
    /// Tasks served by the style that was asked for
    pub successful_primary: u64,
    /// Tasks served by a fallback style or the safety net
    pub fallback_used: u64,
    /// Tasks that returned an error
    pub failed: u64,
    /// Successful tasks per engine id
    pub per_engine_usage: BTreeMap<String, u64>,
    /// Mean latency over the rolling window
    pub rolling_average_latency: Option<Duration>,
    /// Samples currently in the window
    pub latency_samples: usize,
}

impl RunStatsSnapshot {
    /// Fraction of completed tasks that needed a fallback
    pub fn fallback_rate(&self) -> f64 {
        if self.total_processed == 0 {
            0.0
        } else {
            self.fallback_used as f64 / self.total_processed as f64
        }
    }
}

#[derive(Debug, Default)]
struct StatsState {
    counters: RunStatsSnapshot,
    latencies: VecDeque<Duration>,
}

/// Thread-safe run statistics
#[derive(Debug)]
pub struct RunStats {
    state: Mutex<StatsState>,
    window: usize,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new(20)
    }
}

impl RunStats {
    pub fn new(window: usize) -> Self {
        Self {
            state: Mutex::new(StatsState::default()),
            window: window.max(1),
        }
    }

    /// Uses `stats.latency_window`
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        Self::new(config_manager.get_usize("stats.latency_window").unwrap_or(20))
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn record_success(&self, engine: &str, used_fallback: bool, latency: Duration) {
        let mut state = self.state.lock();
        state.counters.total_processed += 1;
        if used_fallback {
            state.counters.fallback_used += 1;
        } else {
            state.counters.successful_primary += 1;
        }
        *state.counters.per_engine_usage.entry(engine.to_string()).or_insert(0) += 1;
        self.push_latency(&mut state, latency);
        trace!("Recorded success on '{}' in {:?}", engine, latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        let mut state = self.state.lock();
        state.counters.total_processed += 1;
        state.counters.failed += 1;
        self.push_latency(&mut state, latency);
    }

    fn push_latency(&self, state: &mut StatsState, latency: Duration) {
        if state.latencies.len() == self.window {
            state.latencies.pop_front();
        }
        state.latencies.push_back(latency);

        let total: Duration = state.latencies.iter().sum();
        state.counters.rolling_average_latency = Some(total / state.latencies.len() as u32);
        state.counters.latency_samples = state.latencies.len();
    }

    pub fn rolling_average_latency(&self) -> Option<Duration> {
        self.state.lock().counters.rolling_average_latency
    }

    pub fn snapshot(&self) -> RunStatsSnapshot {
        self.state.lock().counters.clone()
    }

    /// Drops the latency window; counters are kept
    pub fn clear_latencies(&self) {
        let mut state = self.state.lock();
        state.latencies.clear();
        state.counters.rolling_average_latency = None;
        state.counters.latency_samples = 0;
    }
}
