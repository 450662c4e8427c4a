//! Configuration management for the sketch orchestrator
//!
//! This crate provides layered runtime settings (defaults, file, environment) and
//! the static catalog of tiers, styles and model descriptors, which is validated
//! once at startup.

pub mod catalog;
pub mod defaults;
pub mod manager;
pub mod validation;

// Re-export commonly used types
pub use catalog::Catalog;
pub use defaults::default_catalog;
pub use manager::ConfigManager;
pub use validation::{fallback_chain, CatalogValidator};
