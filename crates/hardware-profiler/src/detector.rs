//! Capability detection
//!
//! Every check runs through [`guarded`], so a failing or unsupported check turns
//! into a conservative default instead of an error. Detection itself never fails.

use std::path::Path;
use std::sync::Arc;

use bytesize::ByteSize;
use sysinfo::{System, SystemExt};
use tracing::{debug, info};

use common::error::{Error, Result};
use common::models::CapabilitySnapshot;
use common::types::ConnectionClass;
use config::ConfigManager;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Probes the host for acceleration paths and hardware hints
#[derive(Debug, Clone)]
pub struct CapabilityProbe {
    /// Configuration manager
    config_manager: Arc<ConfigManager>,
}

impl CapabilityProbe {
    /// Creates a new capability probe
    pub fn new(config_manager: Arc<ConfigManager>) -> Self {
        Self { config_manager }
    }

    /// Detects the current capabilities, applying any `probe.*` overrides
    pub fn detect(&self) -> CapabilitySnapshot {
        let fallback = CapabilitySnapshot::conservative();

        let mut snapshot = CapabilitySnapshot {
            accelerated_gpu: guarded("accelerated_gpu", false, detect_accelerated_gpu),
            intermediate_gpu: guarded("intermediate_gpu", false, detect_intermediate_gpu),
            portable_compute: guarded("portable_compute", false, detect_portable_compute),
            memory_gb: guarded("memory", fallback.memory_gb, detect_memory_gb),
            cores: guarded("cores", fallback.cores, detect_cores),
            is_mobile: cfg!(any(target_os = "android", target_os = "ios")),
            connection: guarded("connection", ConnectionClass::Unknown, || {
                self.connection_hint()
            }),
            battery_level: guarded("battery", None, detect_battery_level),
        };

        self.apply_overrides(&mut snapshot);

        info!(
            "Detected capabilities: accelerated_gpu={}, intermediate_gpu={}, portable_compute={}, memory={:.1} GiB, cores={}, mobile={}, connection={}",
            snapshot.accelerated_gpu,
            snapshot.intermediate_gpu,
            snapshot.portable_compute,
            snapshot.memory_gb,
            snapshot.cores,
            snapshot.is_mobile,
            snapshot.connection
        );

        snapshot
    }

    fn connection_hint(&self) -> Result<ConnectionClass> {
        match self.config_manager.get_string("probe.connection") {
            Ok(raw) => raw.parse().map_err(Error::CapabilityDetection),
            Err(_) => Ok(ConnectionClass::Unknown),
        }
    }

    fn apply_overrides(&self, snapshot: &mut CapabilitySnapshot) {
        let config = &self.config_manager;

        if let Ok(value) = config.get_bool("probe.accelerated_gpu") {
            snapshot.accelerated_gpu = value;
        }
        if let Ok(value) = config.get_bool("probe.intermediate_gpu") {
            snapshot.intermediate_gpu = value;
        }
        if let Ok(value) = config.get_bool("probe.portable_compute") {
            snapshot.portable_compute = value;
        }
        if let Ok(value) = config.get_f64("probe.memory_gb") {
            snapshot.memory_gb = value;
        }
        if let Ok(value) = config.get_usize("probe.cores") {
            snapshot.cores = value;
        }
        if let Ok(value) = config.get_bool("probe.is_mobile") {
            snapshot.is_mobile = value;
        }
        if let Ok(value) = config.get_f32("probe.battery_level") {
            snapshot.battery_level = Some(value.clamp(0.0, 1.0));
        }
    }
}

/// Runs one capability check, substituting `default` on failure
pub fn guarded<T, F>(name: &str, default: T, check: F) -> T
where
    F: FnOnce() -> Result<T>,
{
    match check() {
        Ok(value) => value,
        Err(e) => {
            debug!(check = name, error = %e, "Capability check failed, using default");
            default
        }
    }
}

fn unsupported(what: &str) -> Error {
    Error::CapabilityDetection(format!("{} detection is not supported on this platform", what))
}

fn detect_accelerated_gpu() -> Result<bool> {
    if cfg!(target_os = "linux") {
        Ok(Path::new("/dev/nvidia0").exists() || Path::new("/proc/driver/nvidia/version").exists())
    } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        // Apple silicon always exposes Metal.
        Ok(true)
    } else {
        Err(unsupported("accelerated GPU"))
    }
}

fn detect_intermediate_gpu() -> Result<bool> {
    if cfg!(target_os = "linux") {
        let entries = std::fs::read_dir("/dev/dri")?;
        Ok(entries
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_name().to_string_lossy().starts_with("renderD")))
    } else if cfg!(target_os = "macos") {
        Ok(true)
    } else {
        Err(unsupported("intermediate GPU"))
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_portable_compute() -> Result<bool> {
    Ok(is_x86_feature_detected!("avx2") || is_x86_feature_detected!("sse4.1"))
}

#[cfg(target_arch = "aarch64")]
fn detect_portable_compute() -> Result<bool> {
    Ok(std::arch::is_aarch64_feature_detected!("neon"))
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_portable_compute() -> Result<bool> {
    Err(unsupported("SIMD"))
}

fn detect_memory_gb() -> Result<f64> {
    let mut system = System::new();
    system.refresh_memory();

    let total = system.total_memory();
    if total == 0 {
        return Err(Error::CapabilityDetection("total memory reported as zero".to_string()));
    }

    debug!("Total memory: {}", ByteSize(total));
    Ok(total as f64 / GIB)
}

fn detect_cores() -> Result<usize> {
    match num_cpus::get() {
        0 => Err(Error::CapabilityDetection("core count reported as zero".to_string())),
        cores => Ok(cores),
    }
}

fn detect_battery_level() -> Result<Option<f32>> {
    if !cfg!(target_os = "linux") {
        return Err(unsupported("battery"));
    }

    let supplies = match std::fs::read_dir("/sys/class/power_supply") {
        Ok(entries) => entries,
        Err(_) => return Ok(None),
    };

    for entry in supplies.filter_map(|e| e.ok()) {
        if !entry.file_name().to_string_lossy().starts_with("BAT") {
            continue;
        }
        let raw = std::fs::read_to_string(entry.path().join("capacity"))?;
        let percent: f32 = raw
            .trim()
            .parse()
            .map_err(|_| Error::CapabilityDetection(format!("unreadable battery capacity '{}'", raw.trim())))?;
        return Ok(Some((percent / 100.0).clamp(0.0, 1.0)));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(overrides: &[(&str, &str)]) -> CapabilityProbe {
        let config = ConfigManager::with_overrides(overrides.iter().copied()).unwrap();
        CapabilityProbe::new(Arc::new(config))
    }

    #[test]
    fn test_guard_substitutes_default() {
        let value = guarded("failing", 2usize, || Err(Error::CapabilityDetection("boom".into())));
        assert_eq!(value, 2);
        assert!(guarded("ok", false, || Ok(true)));
    }

    #[test]
    fn test_detect_produces_sane_snapshot() {
        let snapshot = probe(&[]).detect();
        assert!(snapshot.memory_gb > 0.0);
        assert!(snapshot.cores >= 1);
        if let Some(level) = snapshot.battery_level {
            assert!((0.0..=1.0).contains(&level));
        }
    }

    #[test]
    fn test_overrides_pin_snapshot() {
        let snapshot = probe(&[
            ("probe.accelerated_gpu", "true"),
            ("probe.intermediate_gpu", "false"),
            ("probe.portable_compute", "true"),
            ("probe.memory_gb", "8"),
            ("probe.cores", "8"),
            ("probe.is_mobile", "false"),
            ("probe.connection", "4g"),
            ("probe.battery_level", "1.5"),
        ])
        .detect();

        assert!(snapshot.accelerated_gpu);
        assert!(!snapshot.intermediate_gpu);
        assert!(snapshot.portable_compute);
        assert_eq!(snapshot.memory_gb, 8.0);
        assert_eq!(snapshot.cores, 8);
        assert!(!snapshot.is_mobile);
        assert_eq!(snapshot.connection, ConnectionClass::Cellular4g);
        assert_eq!(snapshot.battery_level, Some(1.0));
    }

    #[test]
    fn test_bad_connection_hint_falls_back() {
        let snapshot = probe(&[("probe.connection", "carrier-pigeon")]).detect();
        assert_eq!(snapshot.connection, ConnectionClass::Unknown);
    }
}
