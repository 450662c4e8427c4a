//! Filter pipeline engine
//!
//! A pipeline artifact is a JSON manifest listing filter stages, for example
//! `{"name": "pencil", "stages": [{"op": "grayscale"}, {"op": "sobel"}]}`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::error::{Error, Result};
use common::types::{ImageBuffer, ProcessingOptions, PIPELINE_ENGINE_ID};
use common::utils::ensure_not_cancelled;
use model_manager::{CacheControl, ModelCache};

use crate::adapter::{EngineAdapter, EngineCapabilities, EngineMetadata, EngineOutput};
use crate::backend::ExecutionBackend;
use crate::filters::{blend, box_blur, invert, luminance, normalize, posterize, render, sobel, threshold, Plane};
use crate::runtime::{EngineContext, ModelRuntime};

const MAX_BLUR_RADIUS: usize = 8;

/// One filter stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Stage {
    /// Resets the working plane to the image luminance
    Grayscale,
    Blur { radius: usize },
    Sobel,
    Threshold { level: f32 },
    Invert,
    Posterize { levels: u8 },
    /// Mixes in the darkness of the original image
    BlendOriginal { alpha: f32 },
}

/// A parsed pipeline manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineManifest {
    pub name: String,
    pub stages: Vec<Stage>,
}

impl PipelineManifest {
    /// Parses and validates a manifest; problems yield `ModelLoad`
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: PipelineManifest = serde_json::from_slice(bytes)
            .map_err(|e| Error::ModelLoad(format!("invalid pipeline manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::ModelLoad(format!("pipeline '{}' has no stages", self.name)));
        }
        for stage in &self.stages {
            match stage {
                Stage::Blur { radius } if *radius > MAX_BLUR_RADIUS => {
                    return Err(Error::ModelLoad(format!(
                        "pipeline '{}': blur radius {} exceeds {}",
                        self.name, radius, MAX_BLUR_RADIUS
                    )));
                }
                Stage::Threshold { level } if !(0.0..=1.0).contains(level) => {
                    return Err(Error::ModelLoad(format!(
                        "pipeline '{}': threshold {} is outside [0, 1]",
                        self.name, level
                    )));
                }
                Stage::BlendOriginal { alpha } if !(0.0..=1.0).contains(alpha) => {
                    return Err(Error::ModelLoad(format!(
                        "pipeline '{}': blend alpha {} is outside [0, 1]",
                        self.name, alpha
                    )));
                }
                Stage::Posterize { levels } if *levels < 2 => {
                    return Err(Error::ModelLoad(format!(
                        "pipeline '{}': posterize needs at least 2 levels",
                        self.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Runs the stages over an image and returns the stroke plane
    pub fn run(&self, image: &ImageBuffer, parallel: bool, cancel: &CancellationToken) -> Result<Plane> {
        let original = luminance(image);
        let mut plane = original.clone();

        for stage in &self.stages {
            ensure_not_cancelled(cancel, "pipeline stage")?;
            plane = match stage {
                Stage::Grayscale => original.clone(),
                Stage::Blur { radius } => box_blur(&plane, *radius, parallel),
                Stage::Sobel => sobel(&plane, parallel),
                Stage::Threshold { level } => threshold(&plane, *level),
                Stage::Invert => invert(&plane),
                Stage::Posterize { levels } => posterize(&plane, *levels),
                Stage::BlendOriginal { alpha } => blend(&plane, &invert(&original), *alpha),
            };
        }

        Ok(normalize(&plane))
    }
}

/// Engine running filter pipelines
pub struct PipelineEngine {
    runtime: ModelRuntime<PipelineManifest>,
}

impl PipelineEngine {
    pub fn new(context: EngineContext) -> Self {
        Self {
            runtime: ModelRuntime::new(PIPELINE_ENGINE_ID, context),
        }
    }

    pub fn cache(&self) -> Arc<ModelCache<PipelineManifest>> {
        self.runtime.cache().clone()
    }

    pub fn backend(&self) -> Option<ExecutionBackend> {
        self.runtime.backend()
    }
}

#[async_trait]
impl EngineAdapter for PipelineEngine {
    fn id(&self) -> &str {
        PIPELINE_ENGINE_ID
    }

    async fn initialize(&self) -> Result<()> {
        // The pipeline engine only uses CPU backends.
        self.runtime.initialize(|backend| match backend {
            ExecutionBackend::Portable => Ok(()),
            other => Err(Error::EngineUnavailable(format!("{} backend is not supported", other))),
        })?;
        Ok(())
    }

    async fn process(
        &self,
        image: &ImageBuffer,
        model_id: &str,
        options: &ProcessingOptions,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput> {
        let backend = self.runtime.require_backend()?;
        let started = Instant::now();

        let resolved = self
            .runtime
            .session(model_id, options, cancel, |bytes, _| PipelineManifest::parse(&bytes))
            .await?;

        let manifest = resolved.lookup.handle.clone();
        let parallel = self.runtime.parallel(backend);
        let (image, options, token) = (image.clone(), options.clone(), cancel.clone());

        let output = tokio::task::spawn_blocking(move || {
            let strokes = manifest.run(&image, parallel, &token)?;
            render(&strokes, &options)
        })
        .await
        .map_err(|e| Error::Inference(format!("pipeline task failed: {}", e)))??;

        debug!("Pipeline '{}' finished in {:?}", resolved.model_key, started.elapsed());

        Ok(EngineOutput {
            image: output,
            metadata: EngineMetadata {
                engine: PIPELINE_ENGINE_ID.to_string(),
                backend,
                model_key: Some(resolved.model_key),
                cache_hit: resolved.lookup.cache_hit,
                inference_time: started.elapsed(),
            },
        })
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            engine: PIPELINE_ENGINE_ID.to_string(),
            backend: self.runtime.backend(),
            model_ids: self.runtime.model_ids(),
            uses_models: true,
        }
    }

    fn cache_control(&self) -> Option<Arc<dyn CacheControl>> {
        Some(self.runtime.cache().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let json = br#"{"name": "ink", "stages": [
            {"op": "grayscale"},
            {"op": "blur", "radius": 2},
            {"op": "sobel"},
            {"op": "posterize", "levels": 4},
            {"op": "blend_original", "alpha": 0.3}
        ]}"#;
        let manifest = PipelineManifest::parse(json).unwrap();
        assert_eq!(manifest.stages.len(), 5);
        assert_eq!(manifest.stages[1], Stage::Blur { radius: 2 });
    }

    #[test]
    fn test_parse_rejects_bad_manifests() {
        assert!(matches!(PipelineManifest::parse(b"not json"), Err(Error::ModelLoad(_))));
        assert!(matches!(
            PipelineManifest::parse(br#"{"name": "x", "stages": []}"#),
            Err(Error::ModelLoad(_))
        ));
        assert!(matches!(
            PipelineManifest::parse(br#"{"name": "x", "stages": [{"op": "threshold", "level": 2.0}]}"#),
            Err(Error::ModelLoad(_))
        ));
        assert!(matches!(
            PipelineManifest::parse(br#"{"name": "x", "stages": [{"op": "melt"}]}"#),
            Err(Error::ModelLoad(_))
        ));
    }

    #[test]
    fn test_run_and_cancel() {
        let mut pixels = Vec::new();
        for _ in 0..6 {
            for x in 0..6 {
                let v = if x < 3 { 0 } else { 255 };
                pixels.extend_from_slice(&[v, v, v, 255]);
            }
        }
        let image = ImageBuffer::new(6, 6, pixels).unwrap();
        let manifest = PipelineManifest {
            name: "edges".to_string(),
            stages: vec![Stage::Grayscale, Stage::Sobel, Stage::Threshold { level: 0.5 }],
        };

        let token = CancellationToken::new();
        let plane = manifest.run(&image, false, &token).unwrap();
        assert_eq!(plane.dim(), (6, 6));
        assert_eq!(plane[[2, 3]], 1.0);
        assert_eq!(plane[[2, 0]], 0.0);

        token.cancel();
        assert!(matches!(manifest.run(&image, false, &token), Err(Error::Cancelled(_))));
    }
}
