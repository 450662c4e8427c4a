//! Common data models for the sketch orchestrator
//!
//! This module defines the records shared between the capability probe, the tier
//! catalog, the model catalog and the style catalog.

use serde::{Deserialize, Serialize};

use crate::types::{ConnectionClass, EngineTarget, QualityLevel};

/// Point-in-time record of detected hardware and runtime features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    /// Accelerated GPU path (CUDA / Metal class)
    pub accelerated_gpu: bool,
    /// Intermediate GPU path (generic render node / GL class)
    pub intermediate_gpu: bool,
    /// Portable compute path (SIMD capable CPU)
    pub portable_compute: bool,
    /// Total memory in GiB
    pub memory_gb: f64,
    /// Logical core count
    pub cores: usize,
    /// Whether the host is a mobile device
    pub is_mobile: bool,
    /// Network connection hint
    pub connection: ConnectionClass,
    /// Battery charge in `[0, 1]`, when a battery is present
    pub battery_level: Option<f32>,
}

impl CapabilitySnapshot {
    /// The conservative snapshot assumed when nothing can be detected
    pub fn conservative() -> Self {
        Self {
            accelerated_gpu: false,
            intermediate_gpu: false,
            portable_compute: false,
            memory_gb: 1.0,
            cores: 2,
            is_mobile: true,
            connection: ConnectionClass::Unknown,
            battery_level: None,
        }
    }
}

impl Default for CapabilitySnapshot {
    fn default() -> Self {
        Self::conservative()
    }
}

/// Conjunction of field constraints a snapshot must meet for a tier
///
/// Absent fields place no constraint. Boolean flags set to `true` must be present
/// in the snapshot, numeric fields are minima, and `is_mobile` must match exactly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierRequirements {
    pub accelerated_gpu: Option<bool>,
    pub intermediate_gpu: Option<bool>,
    pub portable_compute: Option<bool>,
    pub min_memory_gb: Option<f64>,
    pub min_cores: Option<usize>,
    pub is_mobile: Option<bool>,
}

impl TierRequirements {
    /// Returns true if every snapshot satisfies these requirements
    ///
    /// Flags set to `false` and minima of zero exclude nothing, so they count as
    /// absent.
    pub fn is_unconditional(&self) -> bool {
        let no_flag = |required: Option<bool>| required != Some(true);

        no_flag(self.accelerated_gpu)
            && no_flag(self.intermediate_gpu)
            && no_flag(self.portable_compute)
            && self.min_memory_gb.map_or(true, |min| min <= 0.0)
            && self.min_cores.map_or(true, |min| min == 0)
            && self.is_mobile.is_none()
    }

    /// Evaluates the predicate against a snapshot
    pub fn is_satisfied_by(&self, snapshot: &CapabilitySnapshot) -> bool {
        let flag_ok = |required: Option<bool>, present: bool| match required {
            Some(true) => present,
            _ => true,
        };

        flag_ok(self.accelerated_gpu, snapshot.accelerated_gpu)
            && flag_ok(self.intermediate_gpu, snapshot.intermediate_gpu)
            && flag_ok(self.portable_compute, snapshot.portable_compute)
            && self.min_memory_gb.map_or(true, |min| snapshot.memory_gb >= min)
            && self.min_cores.map_or(true, |min| snapshot.cores >= min)
            && self.is_mobile.map_or(true, |mobile| snapshot.is_mobile == mobile)
    }
}

/// Resource budget attached to a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierBudget {
    /// Maximum sessions held by one engine cache
    pub max_models: usize,
    /// Largest single model an engine may load
    pub max_model_bytes: u64,
    /// Total bytes one engine cache may hold
    pub cache_byte_budget: u64,
    /// Default output quality
    pub quality_level: QualityLevel,
    /// Whether filters may use data parallelism
    pub allows_parallelism: bool,
}

/// Capability tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Stable identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Predicate over a capability snapshot
    #[serde(default)]
    pub requirements: TierRequirements,
    /// Resource budget
    pub budget: TierBudget,
    /// Engine `"auto"` styles resolve to under this tier
    pub preferred_engine: String,
}

/// Static catalog entry describing a loadable model artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model type, also the model id engines are asked for
    pub model_type: String,
    /// Engine that can load this artifact
    pub engine: String,
    /// Quality level of this variant
    pub quality_level: QualityLevel,
    /// `http(s)://`, `file://` or `builtin://` location
    pub source_location: String,
    /// Approximate in-memory size of the loaded session
    pub approx_size_bytes: u64,
    /// Shape of the tensor the model expects, `[channels, height, width]`
    #[serde(default)]
    pub expected_tensor_shape: Vec<usize>,
    /// Hex SHA-256 of the artifact, verified after download when present
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ModelDescriptor {
    /// Cache key for this descriptor
    pub fn cache_key(&self) -> String {
        cache_key(&self.model_type, self.quality_level)
    }
}

/// Builds the cache key `model_type@quality`
pub fn cache_key(model_type: &str, quality: QualityLevel) -> String {
    format!("{}@{}", model_type, quality)
}

/// Style catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleEntry {
    /// Style identifier requested by callers
    pub id: String,
    /// Engine the style is routed to
    pub engine: EngineTarget,
    /// Model type used by model-backed engines; the style id is used when absent
    #[serde(default)]
    pub model: Option<String>,
    /// Style tried next when this one fails
    #[serde(default)]
    pub fallback: Option<String>,
    /// Style needs a second input image
    #[serde(default)]
    pub requires_dual_input: bool,
}

impl StyleEntry {
    /// Model id sent to the engine
    pub fn model_id(&self) -> &str {
        self.model.as_deref().unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desktop() -> CapabilitySnapshot {
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

    #[test]
    fn test_empty_requirements_always_match() {
        let req = TierRequirements::default();
        assert!(req.is_unconditional());
        assert!(req.is_satisfied_by(&desktop()));
        assert!(req.is_satisfied_by(&CapabilitySnapshot::conservative()));
    }

    #[test]
    fn test_requirement_fields() {
        let req = TierRequirements {
            accelerated_gpu: Some(true),
            min_memory_gb: Some(8.0),
            min_cores: Some(8),
            is_mobile: Some(false),
            ..Default::default()
        };
        assert!(req.is_satisfied_by(&desktop()));

        let mut weaker = desktop();
        weaker.memory_gb = 7.5;
        assert!(!req.is_satisfied_by(&weaker));

        let mut mobile = desktop();
        mobile.is_mobile = true;
        assert!(!req.is_satisfied_by(&mobile));

        let mut no_gpu = desktop();
        no_gpu.accelerated_gpu = false;
        assert!(!req.is_satisfied_by(&no_gpu));
    }

    #[test]
    fn test_false_flag_is_not_a_constraint() {
        let req = TierRequirements {
            accelerated_gpu: Some(false),
            ..Default::default()
        };
        assert!(req.is_satisfied_by(&desktop()));
        assert!(req.is_unconditional());

        let req = TierRequirements {
            intermediate_gpu: Some(false),
            portable_compute: Some(false),
            min_memory_gb: Some(0.0),
            min_cores: Some(0),
            ..Default::default()
        };
        assert!(req.is_unconditional());
        assert!(req.is_satisfied_by(&CapabilitySnapshot::conservative()));

        // Matching is exact, so either value of is_mobile excludes some hosts.
        let req = TierRequirements {
            is_mobile: Some(false),
            ..Default::default()
        };
        assert!(!req.is_unconditional());
    }

    #[test]
    fn test_style_model_id_defaults_to_style() {
        let style = StyleEntry {
            id: "ai_sketch".to_string(),
            engine: EngineTarget::Auto,
            model: None,
            fallback: None,
            requires_dual_input: false,
        };
        assert_eq!(style.model_id(), "ai_sketch");
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("edge_net", QualityLevel::High), "edge_net@high");
    }
}
