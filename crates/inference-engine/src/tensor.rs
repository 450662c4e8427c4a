//! Tensor graph engine
//!
//! Loads small convolutional graphs and evaluates them over the luminance of
//! the input image.
//!
//! Artifact layout, all integers and floats little-endian:
//!
//! ```text
//! magic  b"SKTG"
//! u32    format version
//! u32    rank, then `rank` u32 dims of the expected input shape
//! u32    layer count
//! layer: u32 kernel side (odd), u8 activation, f32 bias, side*side f32 weights
//! ```

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ndarray::Array2;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::error::{Error, Result};
use common::models::ModelDescriptor;
use common::types::{ImageBuffer, ProcessingOptions, TENSOR_ENGINE_ID};
use common::utils::ensure_not_cancelled;
use model_manager::{CacheControl, ModelCache};

use crate::adapter::{EngineAdapter, EngineCapabilities, EngineMetadata, EngineOutput};
use crate::backend::ExecutionBackend;
use crate::filters::{convolve, luminance, normalize, render, Plane};
use crate::runtime::{EngineContext, ModelRuntime};

pub const TENSOR_MAGIC: &[u8; 4] = b"SKTG";
pub const TENSOR_FORMAT_VERSION: u32 = 1;
const MAX_KERNEL_SIDE: usize = 15;
const MAX_LAYERS: usize = 64;
const MAX_RANK: usize = 4;

/// Per-layer activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    Abs,
    Tanh,
}

impl Activation {
    fn code(self) -> u8 {
        match self {
            Activation::Identity => 0,
            Activation::Relu => 1,
            Activation::Abs => 2,
            Activation::Tanh => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Activation::Identity),
            1 => Ok(Activation::Relu),
            2 => Ok(Activation::Abs),
            3 => Ok(Activation::Tanh),
            other => Err(Error::ModelLoad(format!("unknown activation code {}", other))),
        }
    }

    fn apply(self, value: f32) -> f32 {
        match self {
            Activation::Identity => value,
            Activation::Relu => value.max(0.0),
            Activation::Abs => value.abs(),
            Activation::Tanh => value.tanh(),
        }
    }
}

/// One convolution layer
#[derive(Debug, Clone, PartialEq)]
pub struct ConvLayer {
    /// Square kernel with an odd side
    pub kernel: Array2<f32>,
    pub bias: f32,
    pub activation: Activation,
}

/// A loaded tensor graph
#[derive(Debug, Clone, PartialEq)]
pub struct TensorGraph {
    /// Expected input shape, `[channels, height, width]`
    pub input_shape: Vec<usize>,
    pub layers: Vec<ConvLayer>,
}

impl TensorGraph {
    /// Serializes the graph in artifact layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(TENSOR_MAGIC);
        buf.put_u32_le(TENSOR_FORMAT_VERSION);
        buf.put_u32_le(self.input_shape.len() as u32);
        for dim in &self.input_shape {
            buf.put_u32_le(*dim as u32);
        }
        buf.put_u32_le(self.layers.len() as u32);
        for layer in &self.layers {
            buf.put_u32_le(layer.kernel.nrows() as u32);
            buf.put_u8(layer.activation.code());
            buf.put_f32_le(layer.bias);
            for weight in layer.kernel.iter() {
                buf.put_f32_le(*weight);
            }
        }
        buf.freeze()
    }

    /// Parses an artifact; malformed input yields `ModelLoad`
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        need(&buf, 4, "magic")?;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != TENSOR_MAGIC {
            return Err(Error::ModelLoad("not a tensor graph artifact".to_string()));
        }

        need(&buf, 4, "version")?;
        let version = buf.get_u32_le();
        if version != TENSOR_FORMAT_VERSION {
            return Err(Error::ModelLoad(format!(
                "unsupported tensor graph version {}",
                version
            )));
        }

        need(&buf, 4, "rank")?;
        let rank = buf.get_u32_le() as usize;
        if rank > MAX_RANK {
            return Err(Error::ModelLoad(format!("input rank {} is too large", rank)));
        }
        need(&buf, rank * 4, "input shape")?;
        let input_shape = (0..rank).map(|_| buf.get_u32_le() as usize).collect();

        need(&buf, 4, "layer count")?;
        let layer_count = buf.get_u32_le() as usize;
        if layer_count == 0 || layer_count > MAX_LAYERS {
            return Err(Error::ModelLoad(format!("invalid layer count {}", layer_count)));
        }

        let mut layers = Vec::with_capacity(layer_count);
        for index in 0..layer_count {
            need(&buf, 9, "layer header")?;
            let side = buf.get_u32_le() as usize;
            if side == 0 || side % 2 == 0 || side > MAX_KERNEL_SIDE {
                return Err(Error::ModelLoad(format!(
                    "layer {} has invalid kernel side {}",
                    index, side
                )));
            }
            let activation = Activation::from_code(buf.get_u8())?;
            let bias = buf.get_f32_le();

            need(&buf, side * side * 4, "kernel weights")?;
            let weights: Vec<f32> = (0..side * side).map(|_| buf.get_f32_le()).collect();
            if weights.iter().any(|w| !w.is_finite()) || !bias.is_finite() {
                return Err(Error::ModelLoad(format!("layer {} has non-finite weights", index)));
            }
            let kernel = Array2::from_shape_vec((side, side), weights)
                .map_err(|e| Error::ModelLoad(format!("layer {}: {}", index, e)))?;

            layers.push(ConvLayer { kernel, bias, activation });
        }

        if buf.has_remaining() {
            return Err(Error::ModelLoad(format!(
                "{} trailing bytes after the last layer",
                buf.remaining()
            )));
        }

        Ok(Self { input_shape, layers })
    }

    /// Fails unless the graph matches the descriptor's expected shape
    pub fn check_shape(&self, descriptor: &ModelDescriptor) -> Result<()> {
        if !descriptor.expected_tensor_shape.is_empty() && descriptor.expected_tensor_shape != self.input_shape {
            return Err(Error::ModelLoad(format!(
                "'{}' expects shape {:?} but the artifact declares {:?}",
                descriptor.cache_key(),
                descriptor.expected_tensor_shape,
                self.input_shape
            )));
        }
        match self.input_shape.first() {
            None | Some(1) => Ok(()),
            Some(channels) => Err(Error::ModelLoad(format!(
                "only single-channel graphs are supported, got {} channels",
                channels
            ))),
        }
    }

    /// Runs every layer; the result is normalized to `[0, 1]`
    ///
    /// The token is checked before each layer.
    pub fn evaluate(&self, input: &Plane, parallel: bool, cancel: &CancellationToken) -> Result<Plane> {
        let mut plane = input.clone();
        for layer in &self.layers {
            ensure_not_cancelled(cancel, "tensor graph evaluation")?;
            plane = convolve(&plane, &layer.kernel, parallel);
            let (bias, activation) = (layer.bias, layer.activation);
            plane.mapv_inplace(|v| activation.apply(v + bias));
        }
        Ok(normalize(&plane))
    }
}

fn need(buf: &&[u8], len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        Err(Error::ModelLoad(format!("artifact truncated while reading {}", what)))
    } else {
        Ok(())
    }
}

/// Engine evaluating tensor graphs
pub struct TensorGraphEngine {
    runtime: ModelRuntime<TensorGraph>,
}

impl TensorGraphEngine {
    pub fn new(context: EngineContext) -> Self {
        Self {
            runtime: ModelRuntime::new(TENSOR_ENGINE_ID, context),
        }
    }

    /// Session cache
    pub fn cache(&self) -> Arc<ModelCache<TensorGraph>> {
        self.runtime.cache().clone()
    }

    pub fn backend(&self) -> Option<ExecutionBackend> {
        self.runtime.backend()
    }
}

/// Identity graph used to smoke-test a backend
fn probe_graph() -> TensorGraph {
    TensorGraph {
        input_shape: vec![1, 4, 4],
        layers: vec![ConvLayer {
            kernel: Array2::from_elem((1, 1), 1.0),
            bias: 0.0,
            activation: Activation::Identity,
        }],
    }
}

#[async_trait]
impl EngineAdapter for TensorGraphEngine {
    fn id(&self) -> &str {
        TENSOR_ENGINE_ID
    }

    async fn initialize(&self) -> Result<()> {
        let probe = probe_graph();
        let input = Plane::from_elem((4, 4), 0.5);
        let token = CancellationToken::new();
        self.runtime.initialize(|backend| {
            probe
                .evaluate(&input, backend.supports_parallelism(), &token)
                .map(|_| ())
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
            .session(model_id, options, cancel, |bytes, descriptor| {
                let graph = TensorGraph::decode(&bytes)?;
                graph.check_shape(descriptor)?;
                Ok(graph)
            })
            .await?;

        let graph = resolved.lookup.handle.clone();
        let parallel = self.runtime.parallel(backend);
        let (image, options, token) = (image.clone(), options.clone(), cancel.clone());

        let output = tokio::task::spawn_blocking(move || {
            let edges = graph.evaluate(&luminance(&image), parallel, &token)?;
            render(&edges, &options)
        })
        .await
        .map_err(|e| Error::Inference(format!("tensor evaluation task failed: {}", e)))??;

        debug!(
            "Tensor engine ran '{}' on {} backend in {:?}",
            resolved.model_key,
            backend,
            started.elapsed()
        );

        Ok(EngineOutput {
            image: output,
            metadata: EngineMetadata {
                engine: TENSOR_ENGINE_ID.to_string(),
                backend,
                model_key: Some(resolved.model_key),
                cache_hit: resolved.lookup.cache_hit,
                inference_time: started.elapsed(),
            },
        })
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            engine: TENSOR_ENGINE_ID.to_string(),
            backend: self.runtime.backend(),
            model_ids: self.runtime.model_ids(),
            uses_models: true,
        }
    }

    fn cache_control(&self) -> Option<Arc<dyn CacheControl>> {
        Some(self.runtime.cache().clone())
    }
}
