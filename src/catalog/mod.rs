//! Offset catalog module
//!
//! The catalog maps every tracked source object to the number of bytes
//! already exported from it. Rows are provisioned out of band; a sync pass
//! only enumerates them and advances offsets after successful exports.
//!
//! Backends:
//! - [`JsonFileCatalog`]: a single JSON document replaced atomically on every write
//! - [`MemoryCatalog`]: in-process rows for embedding and tests

mod json;
mod lease;
mod memory;

pub use json::*;
pub use lease::*;
pub use memory::*;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// One catalog row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedObject {
    /// Source object identifier (primary key)
    pub source_id: String,
    /// Bytes already exported; never decreases
    pub offset: u64,
    /// Export started but not yet committed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<ExportMarker>,
}

impl TrackedObject {
    /// Create a row with no pending export
    pub fn new(source_id: impl Into<String>, offset: u64) -> Self {
        Self {
            source_id: source_id.into(),
            offset,
            pending: None,
        }
    }
}

/// Write-ahead record of an export in flight.
///
/// Written before the range copy and cleared by the offset advance. A marker
/// that survives to the next pass means a delta may already exist for
/// `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportMarker {
    /// Target the delta was being written to
    pub target_id: String,
    /// First exported byte
    pub start: u64,
    /// One past the last exported byte
    pub end: u64,
    /// When the export started
    pub started_at: DateTime<Utc>,
}

/// Stream of catalog rows produced by [`OffsetCatalog::list_tracked`]
pub type RowStream = BoxStream<'static, Result<TrackedObject>>;

/// Durable source-id → offset mapping
#[async_trait]
pub trait OffsetCatalog: Send + Sync {
    /// Enumerate the catalog as it is at call time.
    ///
    /// The outer error means the catalog cannot be read at all; errors
    /// inside the stream concern individual rows. Every call starts a new
    /// enumeration.
    async fn list_tracked(&self) -> Result<RowStream>;

    /// Atomically set the stored offset of an existing row and clear its
    /// pending marker. Fails with `NotFound` if the row does not exist;
    /// never inserts.
    async fn advance_offset(&self, source_id: &str, new_offset: u64) -> Result<()>;

    /// Record an export about to start. Catalogs without marker support
    /// accept and ignore it.
    async fn mark_pending(&self, source_id: &str, marker: &ExportMarker) -> Result<()> {
        let _ = (source_id, marker);
        Ok(())
    }
}
