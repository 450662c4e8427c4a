//! Hardware capability detection for the sketch orchestrator
//!
//! This crate probes the host for acceleration paths and hardware hints, maps
//! the resulting snapshot to a capability tier, and runs micro-benchmarks that
//! can revise that tier.

pub mod benchmark;
pub mod detector;
pub mod tiers;

// Re-export commonly used types
pub use benchmark::{Benchmark, BenchmarkResult, Classification, Measurement, ScoringConstants, Workload};
pub use detector::CapabilityProbe;
pub use tiers::{ActiveTier, AdaptiveSettings, TierAssigner, TierCatalog, TierTransition, TransitionReason};
