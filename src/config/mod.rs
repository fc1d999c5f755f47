//! Configuration module for DeltaCopy
//!
//! Provides CLI arguments, the JSON config file and the resolved
//! orchestrator settings.

mod settings;

pub use settings::*;
