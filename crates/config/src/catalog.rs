//! Static catalog of tiers, styles and model descriptors

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use common::error::{Error, Result};
use common::models::{ModelDescriptor, StyleEntry, Tier};
use common::types::QualityLevel;

/// Catalog document
///
/// Tiers are ordered strongest first; the last tier must be unconditional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Capability tiers, strongest first
    #[serde(default)]
    pub tiers: Vec<Tier>,

    /// Style mappings
    #[serde(default)]
    pub styles: Vec<StyleEntry>,

    /// Model descriptors
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
}

impl Catalog {
    /// Loads a catalog, choosing the format from the file extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let catalog = match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&content)?,
            "json" => Self::from_json_str(&content)?,
            "toml" => Self::from_toml_str(&content)?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported catalog format '{}' for {}",
                    other,
                    path.display()
                )))
            }
        };

        info!(
            "Loaded catalog from {} ({} tiers, {} styles, {} models)",
            path.display(),
            catalog.tiers.len(),
            catalog.styles.len(),
            catalog.models.len()
        );

        Ok(catalog)
    }

    /// Parses a YAML catalog
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| Error::Config(format!("invalid YAML catalog: {}", e)))
    }

    /// Parses a JSON catalog
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Config(format!("invalid JSON catalog: {}", e)))
    }

    /// Parses a TOML catalog
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML catalog: {}", e)))
    }

    pub fn tier(&self, id: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.id == id)
    }

    pub fn style(&self, id: &str) -> Option<&StyleEntry> {
        self.styles.iter().find(|s| s.id == id)
    }

    /// Descriptor for an exact (engine, model type, quality) triple
    pub fn model(&self, engine: &str, model_type: &str, quality: QualityLevel) -> Option<&ModelDescriptor> {
        self.models
            .iter()
            .find(|m| m.engine == engine && m.model_type == model_type && m.quality_level == quality)
    }

    /// All descriptors served by one engine
    pub fn models_for_engine<'a>(&'a self, engine: &'a str) -> impl Iterator<Item = &'a ModelDescriptor> + 'a {
        self.models.iter().filter(move |m| m.engine == engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use common::types::EngineTarget;

    const YAML: &str = r#"
tiers:
  - id: fast
    name: Fast
    requirements:
      accelerated_gpu: true
    budget:
      max_models: 2
      max_model_bytes: 1000
      cache_byte_budget: 2000
      quality_level: high
      allows_parallelism: true
    preferred_engine: tensor
  - id: floor
    name: Floor
    budget:
      max_models: 1
      max_model_bytes: 100
      cache_byte_budget: 100
      quality_level: low
      allows_parallelism: false
    preferred_engine: deterministic
styles:
  - id: ai_sketch
    engine: auto
    model: edge_net
    fallback: pencil
  - id: pencil
    engine: deterministic
models:
  - model_type: edge_net
    engine: tensor
    quality_level: high
    source_location: builtin://tensor/edge_net/high
    approx_size_bytes: 500
"#;

    #[test]
    fn test_parse_yaml() {
        let catalog = Catalog::from_yaml_str(YAML).unwrap();
        assert_eq!(catalog.tiers.len(), 2);
        assert!(catalog.tier("floor").unwrap().requirements.is_unconditional());
        assert_eq!(catalog.style("ai_sketch").unwrap().engine, EngineTarget::Auto);
        assert!(catalog.style("pencil").unwrap().engine.is_deterministic());
        assert!(catalog.model("tensor", "edge_net", QualityLevel::High).is_some());
        assert!(catalog.model("tensor", "edge_net", QualityLevel::Low).is_none());
        assert_eq!(catalog.models_for_engine("tensor").count(), 1);
    }

    #[test]
    fn test_load_by_extension() {
        let json = serde_json::to_string(&Catalog::from_yaml_str(YAML).unwrap()).unwrap();
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let catalog = Catalog::load(file.path()).unwrap();
        assert_eq!(catalog.styles.len(), 2);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(matches!(Catalog::load(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_document_is_config_error() {
        assert!(matches!(Catalog::from_toml_str("tiers = 3"), Err(Error::Config(_))));
    }
}
