//! Error types for DeltaCopy
//!
//! This module defines the error taxonomy shared by the catalog, the storage
//! backends and the sync orchestrator. Row-level errors are isolated by the
//! orchestrator; pass-level errors abort the whole pass.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for DeltaCopy operations
#[derive(Error, Debug)]
pub enum DeltaCopyError {
    /// Source object or catalog row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Source object could not be inspected (permission, transient fault)
    #[error("Source '{source_id}' unavailable: {message}")]
    SourceUnavailable { source_id: String, message: String },

    /// Server-side range copy failed
    #[error("Export of '{source_id}' to '{target_id}' failed: {message}")]
    Export {
        source_id: String,
        target_id: String,
        message: String,
    },

    /// Catalog row could not be written
    #[error("Catalog write for '{source_id}' failed: {message}")]
    CatalogWrite { source_id: String, message: String },

    /// Catalog could not be read at all
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// Row already exists in the catalog
    #[error("Already tracked: {0}")]
    AlreadyTracked(String),

    /// Another owner holds the pass lease
    #[error("Pass lease held by '{holder}' until {expires_at}")]
    LeaseHeld { holder: String, expires_at: String },

    /// Malformed object identifier
    #[error("Invalid object URI: {0}")]
    InvalidUri(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error during local file operations
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error (catalog, config or report)
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DeltaCopyError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a source-unavailable error
    pub fn source_unavailable(source_id: impl Into<String>, message: impl ToString) -> Self {
        Self::SourceUnavailable {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    /// Create an export error
    pub fn export(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Export {
            source_id: source_id.into(),
            target_id: target_id.into(),
            message: message.to_string(),
        }
    }

    /// Create a catalog write error
    pub fn catalog_write(source_id: impl Into<String>, message: impl ToString) -> Self {
        Self::CatalogWrite {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Check if this error is transient and the row will likely succeed on a later pass
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. }
                | Self::Export { .. }
                | Self::CatalogWrite { .. }
                | Self::CatalogUnavailable(_)
                | Self::LeaseHeld { .. }
                | Self::Io { .. }
        )
    }

    /// Get the source identifier associated with this error, if any
    pub fn source_id(&self) -> Option<&str> {
        match self {
            Self::NotFound(id) | Self::AlreadyTracked(id) => Some(id),
            Self::SourceUnavailable { source_id, .. }
            | Self::Export { source_id, .. }
            | Self::CatalogWrite { source_id, .. } => Some(source_id),
            _ => None,
        }
    }
}

/// Result type alias for DeltaCopy operations
pub type Result<T> = std::result::Result<T, DeltaCopyError>;

impl From<std::io::Error> for DeltaCopyError {
    fn from(err: std::io::Error) -> Self {
        DeltaCopyError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for DeltaCopyError {
    fn from(err: serde_json::Error) -> Self {
        DeltaCopyError::Serialization(err.to_string())
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| DeltaCopyError::io(path, e))
    }
}
