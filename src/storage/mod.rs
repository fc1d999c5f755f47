//! Object storage module
//!
//! Defines the two storage seams the orchestrator depends on, the
//! [`SourceInspector`] and the [`RangeExporter`], and the backends that
//! implement them: a local filesystem store using in-kernel range copy,
//! an in-memory store, and (with the `native_s3` feature) AWS S3 using
//! multipart `UploadPartCopy`.

mod local;
mod memory;
#[cfg(feature = "native_s3")]
mod native_s3;
mod throttle;
mod uri;

pub use local::*;
pub use memory::*;
#[cfg(feature = "native_s3")]
pub use native_s3::*;
pub use throttle::*;
pub use uri::*;

use crate::error::Result;
use async_trait::async_trait;

/// Queries existence and size of source objects
#[async_trait]
pub trait SourceInspector: Send + Sync {
    /// Whether the object exists
    async fn exists(&self, source: &ObjectUri) -> Result<bool>;

    /// Current byte length of the object.
    ///
    /// Callers check [`SourceInspector::exists`] first; asking for the size
    /// of a missing object yields `SourceUnavailable`.
    async fn size(&self, source: &ObjectUri) -> Result<u64>;
}

/// Copies a byte range of one object into a new object, server-side
#[async_trait]
pub trait RangeExporter: Send + Sync {
    /// Copy `length` bytes starting at `start` from `source` into the new
    /// object `target`. `length` must be positive. Not idempotent: a failed
    /// call may leave a partial or orphaned target behind.
    async fn export_range(
        &self,
        source: &ObjectUri,
        target: &ObjectUri,
        start: u64,
        length: u64,
    ) -> Result<()>;
}

/// A backend providing both storage seams
pub trait BlobStore: SourceInspector + RangeExporter {
    /// URI scheme this store serves
    fn scheme(&self) -> &str;
}
