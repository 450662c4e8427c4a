//! Adaptation policies
//!
//! Pure decision logic, separate from the loops that apply it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::error::{Error, Result};
use config::ConfigManager;
use resource_manager::{PressureLevel, PressureThresholds};

/// Monitor tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    /// Period of the latency loop
    pub latency_interval: Duration,
    /// Period of the memory loop
    pub memory_interval: Duration,
    /// Rolling latency above which the tier is downgraded
    pub latency_high_water: Duration,
    /// Rolling latency below which an upgrade is considered
    pub latency_low_water: Duration,
    /// Consecutive low samples needed before upgrading
    pub upgrade_after_samples: usize,
    /// Fraction of the cache budget kept under elevated pressure
    pub shrink_factor: f64,
    /// Memory pressure thresholds
    pub thresholds: PressureThresholds,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            latency_interval: Duration::from_secs(30),
            memory_interval: Duration::from_secs(5),
            latency_high_water: Duration::from_millis(8000),
            latency_low_water: Duration::from_millis(1500),
            upgrade_after_samples: 3,
            shrink_factor: 0.5,
            thresholds: PressureThresholds::default(),
        }
    }
}

impl MonitorSettings {
    /// Reads the `monitor.*` keys
    pub fn from_config(config_manager: &ConfigManager) -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            latency_interval: config_manager
                .get_duration("monitor.latency_interval_ms")
                .unwrap_or(defaults.latency_interval),
            memory_interval: config_manager
                .get_duration("monitor.memory_interval_ms")
                .unwrap_or(defaults.memory_interval),
            latency_high_water: config_manager
                .get_duration("monitor.latency_high_water_ms")
                .unwrap_or(defaults.latency_high_water),
            latency_low_water: config_manager
                .get_duration("monitor.latency_low_water_ms")
                .unwrap_or(defaults.latency_low_water),
            upgrade_after_samples: config_manager
                .get_usize("monitor.upgrade_after_samples")
                .unwrap_or(defaults.upgrade_after_samples),
            shrink_factor: config_manager
                .get_f64("monitor.shrink_factor")
                .unwrap_or(defaults.shrink_factor),
            thresholds: PressureThresholds::from_config(config_manager)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.latency_low_water >= self.latency_high_water {
            return Err(Error::Config(format!(
                "latency low-water mark {:?} must be below the high-water mark {:?}",
                self.latency_low_water, self.latency_high_water
            )));
        }
        if !(0.0..=1.0).contains(&self.shrink_factor) {
            return Err(Error::Config(format!(
                "shrink factor {} is outside [0, 1]",
                self.shrink_factor
            )));
        }
        if self.latency_interval.is_zero() || self.memory_interval.is_zero() {
            return Err(Error::Config("monitor intervals must be positive".to_string()));
        }
        Ok(())
    }

    pub fn latency_policy(&self) -> LatencyPolicy {
        LatencyPolicy::new(
            self.latency_high_water,
            self.latency_low_water,
            self.upgrade_after_samples,
        )
    }
}

/// Outcome of one latency evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyDecision {
    Hold,
    Downgrade,
    Upgrade,
}

/// Hysteresis over the rolling latency
#[derive(Debug, Clone)]
pub struct LatencyPolicy {
    high_water: Duration,
    low_water: Duration,
    upgrade_after: usize,
    consecutive_low: usize,
}

impl LatencyPolicy {
    pub fn new(high_water: Duration, low_water: Duration, upgrade_after: usize) -> Self {
        Self {
            high_water,
            low_water,
            upgrade_after: upgrade_after.max(1),
            consecutive_low: 0,
        }
    }

    /// Feeds one rolling-average sample
    ///
    /// `None` means no tasks completed in the window and leaves the streak
    /// untouched.
    pub fn observe(&mut self, average: Option<Duration>, can_upgrade: bool) -> LatencyDecision {
        let Some(average) = average else {
            return LatencyDecision::Hold;
        };

        if average > self.high_water {
            self.consecutive_low = 0;
            return LatencyDecision::Downgrade;
        }

        if average < self.low_water {
            self.consecutive_low += 1;
            if self.consecutive_low >= self.upgrade_after && can_upgrade {
                self.consecutive_low = 0;
                return LatencyDecision::Upgrade;
            }
            return LatencyDecision::Hold;
        }

        self.consecutive_low = 0;
        LatencyDecision::Hold
    }

    pub fn consecutive_low(&self) -> usize {
        self.consecutive_low
    }
}

/// What to do with the caches for a pressure level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryAction {
    None,
    /// Hold every cache at the tier budget scaled by the factor
    Shrink(f64),
    /// Drop every cached session
    Clear,
    /// Put the tier budget back once pressure has eased
    Restore,
}

/// Maps a pressure reading to a cache action given the level seen last tick
pub fn memory_action(previous: PressureLevel, level: PressureLevel, shrink_factor: f64) -> MemoryAction {
    match level {
        PressureLevel::Normal if previous != PressureLevel::Normal => MemoryAction::Restore,
        PressureLevel::Normal => MemoryAction::None,
        PressureLevel::Elevated => MemoryAction::Shrink(shrink_factor),
        PressureLevel::Critical => MemoryAction::Clear,
    }
}
