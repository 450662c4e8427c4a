//! Built-in defaults
//!
//! Runtime setting defaults and the default catalog shipped with the binary.

use config_rs::builder::{ConfigBuilder, DefaultState};

use common::error::{Error, Result};
use common::models::{ModelDescriptor, StyleEntry, Tier, TierBudget, TierRequirements};
use common::types::{
    EngineTarget, QualityLevel, DETERMINISTIC_ENGINE_ID, PIPELINE_ENGINE_ID, TENSOR_ENGINE_ID,
};

use crate::catalog::Catalog;

const MIB: u64 = 1024 * 1024;

/// Applies default values for every runtime setting
pub fn apply_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>> {
    let defaults: [(&str, config_rs::Value); 27] = [
        ("router.timeout_ms", 30_000i64.into()),
        ("queue.max_pending", 64i64.into()),
        ("stats.latency_window", 20i64.into()),
        ("benchmark.on_startup", false.into()),
        ("benchmark.surface_iterations", 200i64.into()),
        ("benchmark.surface_ms_per_point", 5.0f64.into()),
        ("benchmark.allocation_window_ms", 50i64.into()),
        ("benchmark.allocations_per_point", 400.0f64.into()),
        ("benchmark.compute_iterations", 40i64.into()),
        ("benchmark.compute_ms_per_point", 3.0f64.into()),
        ("benchmark.accelerated_iterations", 40i64.into()),
        ("benchmark.accelerated_ms_per_point", 1.5f64.into()),
        ("benchmark.downgrade_below", 40.0f64.into()),
        ("benchmark.upgrade_at_or_above", 80.0f64.into()),
        ("monitor.latency_interval_ms", 30_000i64.into()),
        ("monitor.memory_interval_ms", 5_000i64.into()),
        ("monitor.latency_high_water_ms", 8_000i64.into()),
        ("monitor.latency_low_water_ms", 1_500i64.into()),
        ("monitor.upgrade_after_samples", 3i64.into()),
        ("monitor.memory_shrink_percent", 75.0f64.into()),
        ("monitor.memory_critical_percent", 90.0f64.into()),
        ("monitor.shrink_factor", 0.5f64.into()),
        ("download.connect_timeout_ms", 10_000i64.into()),
        ("download.timeout_ms", 120_000i64.into()),
        ("logging.level", "info".into()),
        ("logging.format", "pretty".into()),
        ("logging.with_target", true.into()),
    ];

    let mut builder = builder;
    for (key, value) in defaults {
        builder = builder
            .set_default(key, value)
            .map_err(|e| Error::Config(e.to_string()))?;
    }

    Ok(builder)
}

/// Default catalog: five tiers, three engines' styles, synthetic built-in models
pub fn default_catalog() -> Catalog {
    Catalog {
        tiers: default_tiers(),
        styles: default_styles(),
        models: default_models(),
    }
}

fn tier(
    id: &str,
    name: &str,
    requirements: TierRequirements,
    budget: TierBudget,
    preferred_engine: &str,
) -> Tier {
    Tier {
        id: id.to_string(),
        name: name.to_string(),
        requirements,
        budget,
        preferred_engine: preferred_engine.to_string(),
    }
}

fn default_tiers() -> Vec<Tier> {
    vec![
        tier(
            "ultra",
            "Ultra (accelerated desktop)",
            TierRequirements {
                accelerated_gpu: Some(true),
                min_memory_gb: Some(8.0),
                min_cores: Some(8),
                is_mobile: Some(false),
                ..Default::default()
            },
            TierBudget {
                max_models: 5,
                max_model_bytes: 200 * MIB,
                cache_byte_budget: 800 * MIB,
                quality_level: QualityLevel::Ultra,
                allows_parallelism: true,
            },
            TENSOR_ENGINE_ID,
        ),
        tier(
            "high",
            "High (accelerated)",
            TierRequirements {
                accelerated_gpu: Some(true),
                min_memory_gb: Some(4.0),
                min_cores: Some(4),
                ..Default::default()
            },
            TierBudget {
                max_models: 4,
                max_model_bytes: 120 * MIB,
                cache_byte_budget: 400 * MIB,
                quality_level: QualityLevel::High,
                allows_parallelism: true,
            },
            TENSOR_ENGINE_ID,
        ),
        tier(
            "standard",
            "Standard (intermediate GPU)",
            TierRequirements {
                intermediate_gpu: Some(true),
                min_memory_gb: Some(4.0),
                min_cores: Some(4),
                ..Default::default()
            },
            TierBudget {
                max_models: 3,
                max_model_bytes: 80 * MIB,
                cache_byte_budget: 200 * MIB,
                quality_level: QualityLevel::Medium,
                allows_parallelism: false,
            },
            PIPELINE_ENGINE_ID,
        ),
        tier(
            "portable",
            "Portable compute",
            TierRequirements {
                portable_compute: Some(true),
                min_memory_gb: Some(1.0),
                min_cores: Some(2),
                ..Default::default()
            },
            TierBudget {
                max_models: 2,
                max_model_bytes: 40 * MIB,
                cache_byte_budget: 80 * MIB,
                quality_level: QualityLevel::Low,
                allows_parallelism: false,
            },
            TENSOR_ENGINE_ID,
        ),
        tier(
            "minimal",
            "Minimal",
            TierRequirements::default(),
            TierBudget {
                max_models: 1,
                max_model_bytes: 20 * MIB,
                cache_byte_budget: 20 * MIB,
                quality_level: QualityLevel::Low,
                allows_parallelism: false,
            },
            DETERMINISTIC_ENGINE_ID,
        ),
    ]
}

fn style(id: &str, engine: &str, model: Option<&str>, fallback: Option<&str>) -> StyleEntry {
    StyleEntry {
        id: id.to_string(),
        engine: EngineTarget::from(engine),
        model: model.map(str::to_string),
        fallback: fallback.map(str::to_string),
        requires_dual_input: false,
    }
}

fn default_styles() -> Vec<StyleEntry> {
    vec![
        style("ai_sketch", "auto", Some("edge_net"), Some("pencil_pipeline")),
        style("anime_lines", TENSOR_ENGINE_ID, Some("anime_lines"), Some("ai_sketch")),
        style("ink_wash", PIPELINE_ENGINE_ID, Some("ink_wash"), Some("charcoal")),
        style("pencil_pipeline", PIPELINE_ENGINE_ID, Some("pencil_pipeline"), Some("pencil")),
        style("pencil", DETERMINISTIC_ENGINE_ID, None, None),
        style("outline", DETERMINISTIC_ENGINE_ID, None, None),
        style("charcoal", DETERMINISTIC_ENGINE_ID, None, None),
    ]
}

fn model(engine: &str, model_type: &str, quality: QualityLevel, size: u64, side: usize) -> ModelDescriptor {
    ModelDescriptor {
        model_type: model_type.to_string(),
        engine: engine.to_string(),
        quality_level: quality,
        source_location: format!("builtin://{}/{}/{}", engine, model_type, quality),
        approx_size_bytes: size,
        expected_tensor_shape: vec![1, side, side],
        sha256: None,
    }
}

fn default_models() -> Vec<ModelDescriptor> {
    let mut models = Vec::new();

    for (quality, size, side) in [
        (QualityLevel::Low, 8 * MIB, 256),
        (QualityLevel::Medium, 24 * MIB, 512),
        (QualityLevel::High, 64 * MIB, 768),
        (QualityLevel::Ultra, 160 * MIB, 1024),
    ] {
        models.push(model(TENSOR_ENGINE_ID, "edge_net", quality, size, side));
    }

    for (quality, size, side) in [
        (QualityLevel::Low, 12 * MIB, 256),
        (QualityLevel::Medium, 32 * MIB, 512),
        (QualityLevel::High, 96 * MIB, 768),
    ] {
        models.push(model(TENSOR_ENGINE_ID, "anime_lines", quality, size, side));
    }

    for (model_type, base) in [("edge_net", 4 * MIB), ("pencil_pipeline", 2 * MIB), ("ink_wash", 3 * MIB)] {
        models.push(model(PIPELINE_ENGINE_ID, model_type, QualityLevel::Low, base, 256));
        models.push(model(PIPELINE_ENGINE_ID, model_type, QualityLevel::Medium, base * 3, 512));
    }

    models
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_shape() {
        let catalog = default_catalog();
        assert_eq!(catalog.tiers.len(), 5);
        assert!(catalog.tiers.last().unwrap().requirements.is_unconditional());
        assert!(catalog.styles.iter().any(|s| s.id == "ai_sketch"));
        assert!(catalog
            .models
            .iter()
            .all(|m| m.source_location.starts_with("builtin://")));
    }

    #[test]
    fn test_budgets_shrink_with_tier() {
        let tiers = default_tiers();
        for pair in tiers.windows(2) {
            assert!(pair[0].budget.max_models >= pair[1].budget.max_models);
            assert!(pair[0].budget.cache_byte_budget >= pair[1].budget.cache_byte_budget);
        }
    }
}
