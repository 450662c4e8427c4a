//! Deterministic engine
//!
//! Pure pixel transforms with no models, no I/O and no randomness. This engine
//! is the router's safety net, so it accepts any model id and only fails on a
//! well-formed image when the caller cancels it. The transform runs on the
//! blocking pool so deadlines and cancellation stay responsive.

use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use common::error::{Error, Result};
use common::types::{ImageBuffer, ProcessingOptions, DETERMINISTIC_ENGINE_ID};
use common::utils::ensure_not_cancelled;

use crate::adapter::{EngineAdapter, EngineCapabilities, EngineMetadata, EngineOutput};
use crate::backend::ExecutionBackend;
use crate::filters::{box_blur, invert, luminance, normalize, posterize, render, sobel, threshold, Plane};

/// Built-in transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeterministicStyle {
    /// Soft graphite strokes
    Pencil,
    /// Hard binary contours
    Outline,
    /// Heavy strokes with tonal shading
    Charcoal,
}

impl DeterministicStyle {
    pub const ALL: [DeterministicStyle; 3] = [
        DeterministicStyle::Pencil,
        DeterministicStyle::Outline,
        DeterministicStyle::Charcoal,
    ];

    /// Maps a style id to a transform; unrecognized ids get `Pencil`
    pub fn from_style_id(style: &str) -> Self {
        match style {
            "outline" => DeterministicStyle::Outline,
            "charcoal" => DeterministicStyle::Charcoal,
            _ => DeterministicStyle::Pencil,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            DeterministicStyle::Pencil => "pencil",
            DeterministicStyle::Outline => "outline",
            DeterministicStyle::Charcoal => "charcoal",
        }
    }

    fn strokes(&self, image: &ImageBuffer) -> Plane {
        let gray = luminance(image);
        match self {
            DeterministicStyle::Pencil => sobel(&box_blur(&gray, 1, false), false),
            DeterministicStyle::Outline => threshold(&sobel(&gray, false), 0.25),
            DeterministicStyle::Charcoal => {
                let edges = sobel(&box_blur(&gray, 2, false), false);
                let shading = posterize(&invert(&gray), 4).mapv(|v| v * 0.35);
                normalize(&(edges + shading))
            }
        }
    }
}

/// Runs a deterministic transform
pub fn transform(image: &ImageBuffer, style: &str, options: &ProcessingOptions) -> Result<ImageBuffer> {
    let style = DeterministicStyle::from_style_id(style);
    trace!("Deterministic transform '{}' on {}x{}", style.id(), image.width(), image.height());
    render(&style.strokes(image), options)
}

/// Engine for the deterministic transforms
#[derive(Debug, Default)]
pub struct DeterministicEngine;

impl DeterministicEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineAdapter for DeterministicEngine {
    fn id(&self) -> &str {
        DETERMINISTIC_ENGINE_ID
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn process(
        &self,
        image: &ImageBuffer,
        model_id: &str,
        options: &ProcessingOptions,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput> {
        ensure_not_cancelled(cancel, "deterministic transform")?;
        let started = Instant::now();

        let (image, style, options) = (image.clone(), model_id.to_string(), options.clone());
        let handle = tokio::task::spawn_blocking(move || transform(&image, &style, &options));

        // The blocking task cannot be interrupted; its result is dropped on cancel.
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(format!("deterministic '{}' cancelled", model_id))),
            joined = handle => joined
                .map_err(|e| Error::Inference(format!("deterministic transform task failed: {}", e)))?,
        }?;

        Ok(EngineOutput {
            image: output,
            metadata: EngineMetadata {
                engine: DETERMINISTIC_ENGINE_ID.to_string(),
                backend: ExecutionBackend::Scalar,
                model_key: None,
                cache_hit: false,
                inference_time: started.elapsed(),
            },
        })
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            engine: DETERMINISTIC_ENGINE_ID.to_string(),
            backend: Some(ExecutionBackend::Scalar),
            model_ids: DeterministicStyle::ALL.iter().map(|s| s.id().to_string()).collect(),
            uses_models: false,
        }
    }
}
