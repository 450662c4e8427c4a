//! Core routing logic for the sketch orchestrator
//!
//! The [`Router`] turns `(image, style, options)` requests into engine calls,
//! following each style's fallback chain, and records every completed task in
//! [`RunStats`].

pub mod router;
pub mod stats;
pub mod styles;

// Re-export commonly used types
pub use router::{ProcessResult, Router, RouterSettings};
pub use stats::{RunStats, RunStatsSnapshot};
pub use styles::{StyleCatalog, SAFETY_NET_STYLE};
