//! # DeltaCopy - Incremental Export of Append-Only Objects
//!
//! DeltaCopy periodically exports the newly appended bytes of growing
//! objects (logs, journals, event files) as separate delta objects. It keeps
//! a catalog of how many bytes of each object have been exported and, on
//! every pass, range-copies only the new bytes server-side.
//!
//! ## Features
//!
//! - **Offset Catalog**: JSON file or in-memory, with a pass lease
//! - **Server-Side Range Copy**: `copy_file_range` locally, `UploadPartCopy` on S3
//! - **Timestamped Delta Names**: `<key>_<YYYYMMDDHHMMSS>` under a target namespace
//! - **Row Isolation**: one failing object never blocks the others
//! - **At-Least-Once Delivery**: a failed commit re-exports the range next pass
//!
//! ## Quick Start
//!
//! ```no_run
//! use deltacopy::config::{CatalogConnection, StorageConnection, SyncConfig};
//! use deltacopy::storage::TargetNamespace;
//! use deltacopy::sync::SyncOrchestrator;
//!
//! # async fn example() -> deltacopy::Result<()> {
//! let config = SyncConfig::new(
//!     TargetNamespace::parse("local://deltas")?,
//!     CatalogConnection::JsonFile { path: "catalog.json".into() },
//!     StorageConnection::Local { root: "/data".into() },
//! );
//!
//! let orchestrator = SyncOrchestrator::connect(config).await?;
//! let report = orchestrator.run_pass().await?;
//! report.print_summary();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod progress;
pub mod storage;
pub mod sync;

// Re-export commonly used types
pub use config::SyncConfig;
pub use error::{DeltaCopyError, Result};
pub use sync::{PassReport, SyncOrchestrator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use deltacopy::prelude::*;
    //! ```

    pub use crate::catalog::{ExportMarker, JsonFileCatalog, LeaseProvider, MemoryCatalog, OffsetCatalog, TrackedObject};
    pub use crate::config::{CatalogConnection, StorageConnection, SyncConfig};
    pub use crate::error::{DeltaCopyError, Result};
    pub use crate::progress::PassProgress;
    pub use crate::storage::{BlobStore, LocalBlobStore, MemoryBlobStore, ObjectUri, RangeExporter, SourceInspector, TargetNamespace};
    pub use crate::sync::{derive_target, PassReport, RowOutcome, SyncOrchestrator};
}
