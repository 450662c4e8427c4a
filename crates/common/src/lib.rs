//! Common utilities and types for the sketch orchestrator
//! 
//! This crate provides shared functionality used across the orchestrator workspace,
//! including the error taxonomy, image and capability records, catalog records,
//! and utility functions.

pub mod error;
pub mod models;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, Result};
pub use models::*;
pub use types::*;
