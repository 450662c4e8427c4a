//! Model management for the sketch orchestrator
//!
//! This crate provides the per-engine model session cache, model descriptor
//! lookup, and artifact fetching with progress tracking and verification.

pub mod cache;
pub mod catalog;
pub mod downloader;

// Re-export commonly used types
pub use cache::{CacheBudget, CacheControl, CacheLookup, CacheUsage, LoadedSession, ModelCache};
pub use catalog::ModelCatalog;
pub use downloader::{verify_sha256, ArtifactFetcher, ArtifactSource, DownloadProgress};
