//! Progress reporting module
//!
//! Provides live progress display for export passes.

mod reporter;

pub use reporter::*;
