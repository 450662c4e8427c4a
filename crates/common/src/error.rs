//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by every layer of the orchestrator.
//! Each variant belongs to one of three groups: configuration errors that fail fast,
//! runtime failures the router may absorb by walking a fallback chain, and
//! infrastructure errors.

use thiserror::Error;

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for orchestrator operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A capability check failed; callers substitute a conservative default
    #[error("Capability detection failed: {0}")]
    CapabilityDetection(String),

    /// Requested style is not in the style catalog
    #[error("Unknown style: {0}")]
    UnknownStyle(String),

    /// Engine id is not known to the catalog
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    /// Model id is not served by the engine it was sent to
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Engine is known but not registered (failed to initialize)
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Model artifact could not be fetched
    #[error("Model download failed: {0}")]
    ModelDownload(String),

    /// Model artifact could not be turned into a session
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// Engine-reported runtime error
    #[error("Inference failed: {0}")]
    Inference(String),

    /// Engine call did not finish within the router timeout
    #[error("Inference timed out: {0}")]
    InferenceTimeout(String),

    /// Work was cancelled through its cancellation token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Every style in the chain and the safety net failed
    #[error("All fallbacks exhausted for style '{style}' after {attempts} attempts: {last_error}")]
    AllFallbacksExhausted {
        /// Style originally requested
        style: String,
        /// Number of engine calls made
        attempts: usize,
        /// Message of the final failure
        last_error: String,
    },

    /// The processing queue is at its pending limit
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Image buffer does not satisfy the RGBA8 contract
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the router may recover by trying the next style in the chain
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::EngineUnavailable(_)
                | Error::ModelDownload(_)
                | Error::ModelLoad(_)
                | Error::Inference(_)
                | Error::InferenceTimeout(_)
                | Error::Cancelled(_)
        )
    }

    /// Returns true if the error indicates a misconfiguration rather than a runtime condition
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::UnknownStyle(_) | Error::UnknownEngine(_) | Error::UnknownModel(_)
        )
    }

    /// Returns true if the error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::InferenceTimeout(_))
    }

    /// Short stable name of the variant, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::CapabilityDetection(_) => "capability_detection",
            Error::UnknownStyle(_) => "unknown_style",
            Error::UnknownEngine(_) => "unknown_engine",
            Error::UnknownModel(_) => "unknown_model",
            Error::EngineUnavailable(_) => "engine_unavailable",
            Error::ModelDownload(_) => "model_download",
            Error::ModelLoad(_) => "model_load",
            Error::Inference(_) => "inference",
            Error::InferenceTimeout(_) => "inference_timeout",
            Error::Cancelled(_) => "cancelled",
            Error::AllFallbacksExhausted { .. } => "all_fallbacks_exhausted",
            Error::QueueFull(_) => "queue_full",
            Error::InvalidImage(_) => "invalid_image",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ModelDownload("404".to_string()).is_retryable());
        assert!(Error::ModelLoad("bad magic".to_string()).is_retryable());
        assert!(Error::Inference("nan".to_string()).is_retryable());
        assert!(Error::InferenceTimeout("30s".to_string()).is_retryable());
        assert!(Error::EngineUnavailable("tensor".to_string()).is_retryable());

        assert!(!Error::UnknownModel("nope".to_string()).is_retryable());
        assert!(!Error::UnknownStyle("nope".to_string()).is_retryable());
        assert!(!Error::InvalidImage("short".to_string()).is_retryable());
    }

    #[test]
    fn test_configuration_classification() {
        assert!(Error::UnknownStyle("x".to_string()).is_configuration());
        assert!(Error::UnknownEngine("x".to_string()).is_configuration());
        assert!(!Error::Inference("x".to_string()).is_configuration());
    }

    #[test]
    fn test_exhausted_message() {
        let err = Error::AllFallbacksExhausted {
            style: "ai_sketch".to_string(),
            attempts: 3,
            last_error: "boom".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ai_sketch"));
        assert!(msg.contains("3 attempts"));
        assert_eq!(err.kind(), "all_fallbacks_exhausted");
    }
}
