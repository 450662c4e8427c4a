//! Resource monitoring for the sketch orchestrator
//!
//! This crate reports memory pressure from the operating system and classifies
//! it against the thresholds the adaptive monitor acts on.

mod monitor;

pub use monitor::{
    ManualPressureSource, MemoryPressureSource, MemoryReading, PressureLevel, PressureThresholds,
    SharedPressureSource, SystemMemoryMonitor,
};
