//! Sketch engines for the sketch orchestrator
//!
//! Three engines implement [`EngineAdapter`]: a tensor-graph engine and a
//! filter-pipeline engine, both backed by cached model sessions, and a
//! deterministic engine that needs no models and never fails. Engines are
//! registered in an [`EngineRegistry`] only if they initialize.

pub mod adapter;
pub mod backend;
pub mod builtin;
pub mod deterministic;
pub mod filters;
pub mod pipeline;
pub mod registry;
pub mod runtime;
pub mod tensor;

// Re-export commonly used types
pub use adapter::{EngineAdapter, EngineCapabilities, EngineMetadata, EngineOutput};
pub use backend::{resolve_backend, ExecutionBackend};
pub use builtin::{BuiltinArtifacts, BuiltinLocation};
pub use deterministic::{transform, DeterministicEngine, DeterministicStyle};
pub use pipeline::{PipelineEngine, PipelineManifest, Stage};
pub use registry::{EngineRegistry, SharedEngine};
pub use runtime::EngineContext;
pub use tensor::{TensorGraph, TensorGraphEngine};
