//! Memory pressure monitoring
//!
//! This module exposes memory pressure as a percentage of total memory in use,
//! and classifies it against configurable thresholds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytesize::ByteSize;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{System, SystemExt};
use tracing::{debug, trace};

use common::error::{Error, Result};
use config::ConfigManager;

/// One memory reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryReading {
    /// Bytes in use
    pub used_bytes: u64,
    /// Total bytes
    pub total_bytes: u64,
}

impl MemoryReading {
    /// Usage as a percentage in `[0, 100]`
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.used_bytes as f64 / self.total_bytes as f64 * 100.0).clamp(0.0, 100.0)
        }
    }
}

/// Something that can report memory pressure
///
/// Returns `None` when the platform does not expose memory usage.
pub trait MemoryPressureSource: Send + Sync {
    fn sample(&self) -> Option<MemoryReading>;
}

/// Memory pressure read from the operating system
pub struct SystemMemoryMonitor {
    /// System information
    system: Mutex<System>,
}

impl std::fmt::Debug for SystemMemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMemoryMonitor").finish()
    }
}

impl SystemMemoryMonitor {
    /// Creates a new system memory monitor
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self { system: Mutex::new(system) }
    }
}

impl Default for SystemMemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPressureSource for SystemMemoryMonitor {
    fn sample(&self) -> Option<MemoryReading> {
        let mut system = self.system.lock();
        system.refresh_memory();

        let total_bytes = system.total_memory();
        if total_bytes == 0 {
            return None;
        }

        let reading = MemoryReading {
            used_bytes: system.used_memory(),
            total_bytes,
        };
        trace!(
            "Memory in use: {} of {} ({:.1}%)",
            ByteSize(reading.used_bytes),
            ByteSize(reading.total_bytes),
            reading.usage_percent()
        );
        Some(reading)
    }
}

/// Memory pressure set by hand; useful when the host exposes no usable reading
#[derive(Debug)]
pub struct ManualPressureSource {
    /// Usage in hundredths of a percent; `u64::MAX` means unavailable
    basis_points: AtomicU64,
}

impl ManualPressureSource {
    const UNAVAILABLE: u64 = u64::MAX;

    /// Creates a source reporting `percent` usage
    pub fn new(percent: f64) -> Self {
        let source = Self { basis_points: AtomicU64::new(Self::UNAVAILABLE) };
        source.set_percent(percent);
        source
    }

    /// Creates a source that reports nothing
    pub fn unavailable() -> Self {
        Self { basis_points: AtomicU64::new(Self::UNAVAILABLE) }
    }

    pub fn set_percent(&self, percent: f64) {
        let clamped = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { 0.0 };
        self.basis_points.store((clamped * 100.0).round() as u64, Ordering::SeqCst);
    }
}

impl MemoryPressureSource for ManualPressureSource {
    fn sample(&self) -> Option<MemoryReading> {
        match self.basis_points.load(Ordering::SeqCst) {
            Self::UNAVAILABLE => None,
            used => Some(MemoryReading { used_bytes: used, total_bytes: 10_000 }),
        }
    }
}

/// Pressure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    /// Above the shrink threshold
    Elevated,
    /// Above the critical threshold
    Critical,
}

/// Memory pressure thresholds, in percent of total memory
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureThresholds {
    /// Usage above which caches shrink
    pub shrink_percent: f64,
    /// Usage above which caches are cleared
    pub critical_percent: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            shrink_percent: 75.0,
            critical_percent: 90.0,
        }
    }
}

impl PressureThresholds {
    /// Reads `monitor.memory_shrink_percent` and `monitor.memory_critical_percent`
    pub fn from_config(config_manager: &ConfigManager) -> Result<Self> {
        let defaults = Self::default();
        let thresholds = Self {
            shrink_percent: config_manager
                .get_f64("monitor.memory_shrink_percent")
                .unwrap_or(defaults.shrink_percent),
            critical_percent: config_manager
                .get_f64("monitor.memory_critical_percent")
                .unwrap_or(defaults.critical_percent),
        };

        if thresholds.shrink_percent > thresholds.critical_percent {
            return Err(Error::Config(format!(
                "memory shrink threshold {}% is above the critical threshold {}%",
                thresholds.shrink_percent, thresholds.critical_percent
            )));
        }

        Ok(thresholds)
    }

    /// Classifies a usage percentage
    pub fn classify(&self, usage_percent: f64) -> PressureLevel {
        if usage_percent > self.critical_percent {
            PressureLevel::Critical
        } else if usage_percent > self.shrink_percent {
            PressureLevel::Elevated
        } else {
            PressureLevel::Normal
        }
    }

    /// Samples a source and classifies the reading
    pub fn evaluate(&self, source: &dyn MemoryPressureSource) -> Option<(MemoryReading, PressureLevel)> {
        let reading = source.sample()?;
        let level = self.classify(reading.usage_percent());
        debug!("Memory pressure {:.1}% -> {:?}", reading.usage_percent(), level);
        Some((reading, level))
    }
}

/// Shared handle to a pressure source
pub type SharedPressureSource = Arc<dyn MemoryPressureSource>;
