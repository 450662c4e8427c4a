//! Model descriptor lookup

use std::collections::HashMap;

use tracing::debug;

use common::error::{Error, Result};
use common::models::ModelDescriptor;
use common::types::QualityLevel;

/// Model descriptors indexed by engine and model type
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    /// engine -> model type -> descriptors sorted by quality
    index: HashMap<String, HashMap<String, Vec<ModelDescriptor>>>,
}

impl ModelCatalog {
    /// Creates a catalog from descriptors
    pub fn new(models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let mut index: HashMap<String, HashMap<String, Vec<ModelDescriptor>>> = HashMap::new();
        for model in models {
            index
                .entry(model.engine.clone())
                .or_default()
                .entry(model.model_type.clone())
                .or_default()
                .push(model);
        }
        for variants in index.values_mut().flat_map(|types| types.values_mut()) {
            variants.sort_by_key(|m| m.quality_level);
        }
        Self { index }
    }

    /// Descriptors one engine serves
    pub fn for_engine(&self, engine: &str) -> ModelCatalog {
        let index = self
            .index
            .get(engine)
            .map(|types| HashMap::from([(engine.to_string(), types.clone())]))
            .unwrap_or_default();
        Self { index }
    }

    /// Returns true if the engine serves the model type at any quality
    pub fn serves(&self, engine: &str, model_type: &str) -> bool {
        self.index
            .get(engine)
            .map_or(false, |types| types.contains_key(model_type))
    }

    /// Model types one engine serves
    pub fn model_types(&self, engine: &str) -> Vec<String> {
        let mut types: Vec<String> = self
            .index
            .get(engine)
            .map(|types| types.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }

    /// Picks the variant to load
    ///
    /// The requested quality is preferred, then each lower level; variants larger
    /// than `max_model_bytes` are skipped. `UnknownModel` is returned when the
    /// engine does not serve the type, `ModelLoad` when nothing fits the size limit.
    pub fn resolve(
        &self,
        engine: &str,
        model_type: &str,
        quality: QualityLevel,
        max_model_bytes: u64,
    ) -> Result<&ModelDescriptor> {
        let variants = self
            .index
            .get(engine)
            .and_then(|types| types.get(model_type))
            .ok_or_else(|| Error::UnknownModel(format!("engine '{}' has no model '{}'", engine, model_type)))?;

        let mut level = Some(quality);
        while let Some(current) = level {
            if let Some(model) = variants
                .iter()
                .find(|m| m.quality_level == current && m.approx_size_bytes <= max_model_bytes)
            {
                if current != quality {
                    debug!("Using '{}' at {} instead of {}", model_type, current, quality);
                }
                return Ok(model);
            }
            level = current.lower();
        }

        Err(Error::ModelLoad(format!(
            "no variant of '{}' at or below {} fits within {} bytes",
            model_type, quality, max_model_bytes
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(model_type: &str, quality: QualityLevel, size: u64) -> ModelDescriptor {
        ModelDescriptor {
            model_type: model_type.to_string(),
            engine: "tensor".to_string(),
            quality_level: quality,
            source_location: format!("builtin://tensor/{}/{}", model_type, quality),
            approx_size_bytes: size,
            expected_tensor_shape: vec![1, 64, 64],
            sha256: None,
        }
    }

    fn catalog() -> ModelCatalog {
        ModelCatalog::new([
            descriptor("edge_net", QualityLevel::High, 300),
            descriptor("edge_net", QualityLevel::Low, 100),
            descriptor("anime", QualityLevel::Medium, 200),
        ])
    }

    #[test]
    fn test_exact_match() {
        let catalog = catalog();
        let model = catalog.resolve("tensor", "edge_net", QualityLevel::High, 1000).unwrap();
        assert_eq!(model.quality_level, QualityLevel::High);
    }

    #[test]
    fn test_quality_falls_back_downward() {
        let catalog = catalog();
        let model = catalog.resolve("tensor", "edge_net", QualityLevel::Ultra, 1000).unwrap();
        assert_eq!(model.quality_level, QualityLevel::High);

        let model = catalog.resolve("tensor", "edge_net", QualityLevel::Medium, 1000).unwrap();
        assert_eq!(model.quality_level, QualityLevel::Low);
    }

    #[test]
    fn test_size_limit_skips_large_variants() {
        let catalog = catalog();
        let model = catalog.resolve("tensor", "edge_net", QualityLevel::High, 150).unwrap();
        assert_eq!(model.quality_level, QualityLevel::Low);

        assert!(matches!(
            catalog.resolve("tensor", "edge_net", QualityLevel::High, 50),
            Err(Error::ModelLoad(_))
        ));
        assert!(matches!(
            catalog.resolve("tensor", "anime", QualityLevel::Low, 1000),
            Err(Error::ModelLoad(_))
        ));
    }

    #[test]
    fn test_unknown_model() {
        let catalog = catalog();
        assert!(matches!(
            catalog.resolve("tensor", "missing", QualityLevel::Low, 1000),
            Err(Error::UnknownModel(_))
        ));
        assert!(matches!(
            catalog.resolve("pipeline", "edge_net", QualityLevel::Low, 1000),
            Err(Error::UnknownModel(_))
        ));
    }

    #[test]
    fn test_engine_view() {
        let catalog = catalog();
        assert!(catalog.serves("tensor", "anime"));
        assert_eq!(catalog.model_types("tensor"), vec!["anime".to_string(), "edge_net".to_string()]);
        assert!(catalog.for_engine("pipeline").model_types("tensor").is_empty());
    }
}
