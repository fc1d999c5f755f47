//! Delta export passes
//!
//! Provides:
//! - Delta object naming
//! - The sync orchestrator running one pass over the catalog
//! - Per-row and per-pass diagnostics

mod naming;
mod orchestrator;
mod report;

pub use naming::*;
pub use orchestrator::*;
pub use report::*;
