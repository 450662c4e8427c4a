//! Runtime adaptation for the sketch orchestrator
//!
//! The [`AdaptiveMonitor`] watches rolling latency and memory pressure and
//! moves the active tier or shrinks engine caches in response.

mod monitor;
mod policy;

pub use monitor::{apply_tier_budgets, AdaptiveMonitor, MonitorHandle};
pub use policy::{memory_action, LatencyDecision, LatencyPolicy, MemoryAction, MonitorSettings};
