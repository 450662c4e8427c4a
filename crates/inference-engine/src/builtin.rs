//! Built-in model artifacts
//!
//! Serves `builtin://{engine}/{model_type}/{quality}` locations by generating
//! tensor graphs and pipeline manifests in memory, so the default catalog works
//! without network access.

use async_trait::async_trait;
use bytes::Bytes;
use ndarray::{array, Array2};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::error::{Error, Result};
use common::models::ModelDescriptor;
use common::types::{QualityLevel, PIPELINE_ENGINE_ID, TENSOR_ENGINE_ID};
use common::utils::ensure_not_cancelled;
use model_manager::ArtifactSource;

use crate::pipeline::{PipelineManifest, Stage};
use crate::tensor::{Activation, ConvLayer, TensorGraph};

const DEFAULT_INPUT_SHAPE: [usize; 3] = [1, 256, 256];

/// Parsed `builtin://` location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinLocation {
    pub engine: String,
    pub model_type: String,
    pub quality: QualityLevel,
}

impl BuiltinLocation {
    pub fn parse(location: &str) -> Result<Self> {
        let path = location
            .strip_prefix("builtin://")
            .ok_or_else(|| Error::ModelDownload(format!("'{}' is not a builtin location", location)))?;

        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            [engine, model_type, quality] if !engine.is_empty() && !model_type.is_empty() => Ok(Self {
                engine: engine.to_string(),
                model_type: model_type.to_string(),
                quality: quality
                    .parse()
                    .map_err(|_| Error::ModelDownload(format!("bad quality in '{}'", location)))?,
            }),
            _ => Err(Error::ModelDownload(format!(
                "expected builtin://engine/model/quality, got '{}'",
                location
            ))),
        }
    }
}

/// Generates built-in artifacts
#[derive(Debug, Default, Clone)]
pub struct BuiltinArtifacts;

impl BuiltinArtifacts {
    pub fn new() -> Self {
        Self
    }

    /// Artifact bytes for a descriptor
    pub fn generate(&self, descriptor: &ModelDescriptor) -> Result<Bytes> {
        let location = BuiltinLocation::parse(&descriptor.source_location)?;
        match location.engine.as_str() {
            TENSOR_ENGINE_ID => {
                let shape = if descriptor.expected_tensor_shape.is_empty() {
                    DEFAULT_INPUT_SHAPE.to_vec()
                } else {
                    descriptor.expected_tensor_shape.clone()
                };
                Ok(tensor_graph(&location.model_type, location.quality, shape).encode())
            }
            PIPELINE_ENGINE_ID => {
                let manifest = pipeline_manifest(&location.model_type, location.quality);
                Ok(Bytes::from(serde_json::to_vec(&manifest)?))
            }
            other => Err(Error::ModelDownload(format!(
                "no builtin artifacts for engine '{}'",
                other
            ))),
        }
    }
}

#[async_trait]
impl ArtifactSource for BuiltinArtifacts {
    async fn fetch(&self, descriptor: &ModelDescriptor, cancel: &CancellationToken) -> Result<Bytes> {
        ensure_not_cancelled(cancel, "builtin artifact")?;
        let bytes = self.generate(descriptor)?;
        debug!("Generated {} bytes for '{}'", bytes.len(), descriptor.source_location);
        Ok(bytes)
    }
}

fn gaussian3() -> Array2<f32> {
    array![[1.0f32, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]] / 16.0
}

fn laplacian3() -> Array2<f32> {
    array![[0.0f32, -1.0, 0.0], [-1.0, 4.0, -1.0], [0.0, -1.0, 0.0]]
}

fn diagonal_laplacian3() -> Array2<f32> {
    array![[-1.0f32, -1.0, -1.0], [-1.0, 8.0, -1.0], [-1.0, -1.0, -1.0]]
}

fn layer(kernel: Array2<f32>, bias: f32, activation: Activation) -> ConvLayer {
    ConvLayer { kernel, bias, activation }
}

/// Edge-detection graph for a model type; higher quality adds smoothing passes
fn tensor_graph(model_type: &str, quality: QualityLevel, input_shape: Vec<usize>) -> TensorGraph {
    let smoothing = match quality {
        QualityLevel::Low => 0,
        QualityLevel::Medium => 1,
        QualityLevel::High | QualityLevel::Ultra => 2,
    };

    let mut layers: Vec<ConvLayer> = (0..smoothing)
        .map(|_| layer(gaussian3(), 0.0, Activation::Identity))
        .collect();

    match model_type {
        "anime_lines" => {
            layers.push(layer(diagonal_laplacian3(), 0.0, Activation::Relu));
            layers.push(layer(Array2::from_elem((1, 1), 6.0), -0.5, Activation::Tanh));
        }
        _ => {
            layers.push(layer(laplacian3(), 0.0, Activation::Abs));
        }
    }

    TensorGraph { input_shape, layers }
}

fn pipeline_manifest(model_type: &str, quality: QualityLevel) -> PipelineManifest {
    let radius = if quality >= QualityLevel::Medium { 1 } else { 0 };
    let stages = match model_type {
        "ink_wash" => vec![
            Stage::Grayscale,
            Stage::Blur { radius: radius + 1 },
            Stage::Sobel,
            Stage::Posterize { levels: 4 },
            Stage::BlendOriginal { alpha: 0.3 },
        ],
        "edge_net" => vec![
            Stage::Grayscale,
            Stage::Blur { radius },
            Stage::Sobel,
            Stage::Threshold { level: 0.15 },
        ],
        _ => vec![Stage::Grayscale, Stage::Blur { radius: radius + 1 }, Stage::Sobel],
    };

    PipelineManifest {
        name: model_type.to_string(),
        stages,
    }
}
