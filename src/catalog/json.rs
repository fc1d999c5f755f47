//! JSON file catalog
//!
//! The whole catalog is one JSON document. Every write goes to a fresh temp
//! file that is then renamed over the catalog, so readers only ever see a
//! complete document and each offset advance is a single atomic write.
//!
//! Writers are serialized twice: an async mutex inside this process, then an
//! exclusive advisory lock on `<catalog>.lock` across processes. Every
//! load-modify-save and every lease change happens under both.
//!
//! The pass lease lives next to the catalog in `<catalog>.lease`.

use super::{ExportMarker, Lease, LeaseProvider, OffsetCatalog, RowStream, TrackedObject};
use crate::error::{DeltaCopyError, IoResultExt, Result};
use crate::storage::ObjectUri;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Current catalog document version
pub const CATALOG_VERSION: u32 = 1;

/// On-disk catalog document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDocument {
    /// Document version
    pub version: u32,
    /// Tracked objects in enumeration order
    pub objects: Vec<TrackedObject>,
}

impl Default for CatalogDocument {
    fn default() -> Self {
        Self {
            version: CATALOG_VERSION,
            objects: Vec::new(),
        }
    }
}

/// Catalog stored as a JSON file
pub struct JsonFileCatalog {
    path: PathBuf,
    lease_path: PathBuf,
    lock_path: PathBuf,
    write_lock: Mutex<()>,
}

/// Held while writing; the file lock is released when the file closes
struct WriteGuard<'a> {
    _file: File,
    _local: MutexGuard<'a, ()>,
}

impl JsonFileCatalog {
    /// Open the catalog at `path`. The file is read lazily.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            lease_path: sibling(&path, ".lease"),
            lock_path: sibling(&path, ".lock"),
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Open the catalog, creating an empty document if none exists
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let catalog = Self::open(path);
        match tokio::fs::metadata(&catalog.path).await {
            Ok(_) => return Ok(catalog),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(DeltaCopyError::io(&catalog.path, e)),
        }

        if let Some(parent) = catalog.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.with_path(parent)?;
        }

        {
            let _guard = catalog.lock().await?;
            // another process may have created it meanwhile
            let exists = tokio::fs::try_exists(&catalog.path).await.with_path(&catalog.path)?;
            if !exists {
                catalog.save(&CatalogDocument::default()).await?;
            }
        }
        Ok(catalog)
    }

    /// Catalog file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All rows, in enumeration order
    pub async fn rows(&self) -> Result<Vec<TrackedObject>> {
        Ok(self.load().await?.objects)
    }

    /// Currently recorded lease, if any
    pub async fn current_lease(&self) -> Result<Option<Lease>> {
        match tokio::fs::read(&self.lease_path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DeltaCopyError::io(&self.lease_path, e)),
        }
    }

    /// Add a new row. Provisioning helper, not used by sync passes.
    pub async fn track(&self, source_id: &str, offset: u64) -> Result<()> {
        ObjectUri::parse(source_id)?;

        let _guard = self.lock().await?;
        let mut doc = self.load().await?;
        if doc.objects.iter().any(|o| o.source_id == source_id) {
            return Err(DeltaCopyError::AlreadyTracked(source_id.to_string()));
        }
        doc.objects.push(TrackedObject::new(source_id, offset));
        self.save(&doc).await
    }

    /// Take the in-process mutex, then the cross-process file lock
    async fn lock(&self) -> Result<WriteGuard<'_>> {
        let local = self.write_lock.lock().await;
        let lock_path = self.lock_path.clone();
        let file = tokio::task::spawn_blocking(move || lock_file(&lock_path))
            .await
            .map_err(io::Error::other)
            .and_then(|locked| locked)
            .with_path(&self.lock_path)?;

        Ok(WriteGuard {
            _file: file,
            _local: local,
        })
    }

    async fn load(&self) -> Result<CatalogDocument> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            DeltaCopyError::CatalogUnavailable(format!("{}: {}", self.path.display(), e))
        })?;

        let doc: CatalogDocument = serde_json::from_slice(&bytes).map_err(|e| {
            DeltaCopyError::CatalogUnavailable(format!("{}: {}", self.path.display(), e))
        })?;

        if doc.version != CATALOG_VERSION {
            return Err(DeltaCopyError::CatalogUnavailable(format!(
                "{}: unsupported catalog version {}",
                self.path.display(),
                doc.version
            )));
        }
        Ok(doc)
    }

    /// Caller must hold the write guard
    async fn save(&self, doc: &CatalogDocument) -> Result<()> {
        let data = serde_json::to_vec_pretty(doc)?;
        write_atomic(self.path.clone(), data).await.with_path(&self.path)
    }

    /// Caller must hold the write guard
    async fn write_lease(&self, lease: &Lease) -> Result<()> {
        let data = serde_json::to_vec(lease)?;
        write_atomic(self.lease_path.clone(), data)
            .await
            .with_path(&self.lease_path)
    }

    /// Load, modify one row, save. Any failure is a catalog write error.
    async fn update_row<F>(&self, source_id: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut TrackedObject) -> std::result::Result<(), String>,
    {
        let _guard = self
            .lock()
            .await
            .map_err(|e| DeltaCopyError::catalog_write(source_id, e))?;
        let mut doc = self
            .load()
            .await
            .map_err(|e| DeltaCopyError::catalog_write(source_id, e))?;

        let row = doc
            .objects
            .iter_mut()
            .find(|o| o.source_id == source_id)
            .ok_or_else(|| DeltaCopyError::NotFound(source_id.to_string()))?;
        update(row).map_err(|msg| DeltaCopyError::catalog_write(source_id, msg))?;

        self.save(&doc)
            .await
            .map_err(|e| DeltaCopyError::catalog_write(source_id, e))
    }
}

/// `<path><suffix>`, e.g. `catalog.json.lease`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Replace `path` with `data` through a uniquely named temp file in the same
/// directory
async fn write_atomic(path: PathBuf, data: Vec<u8>) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&data)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(io::Error::other)?
}

/// Open `path` and block until holding an exclusive lock on it
fn lock_file(path: &Path) -> io::Result<File> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    lock_exclusive(&file)?;
    Ok(file)
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        // SAFETY: the descriptor stays open for the lifetime of `file`
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn lock_exclusive(file: &File) -> io::Result<()> {
    file.lock()
}

fn lease_lost(current: Option<Lease>) -> DeltaCopyError {
    match current {
        Some(current) => DeltaCopyError::LeaseHeld {
            holder: current.owner,
            expires_at: current.expires_at.to_rfc3339(),
        },
        None => DeltaCopyError::LeaseHeld {
            holder: "(released)".to_string(),
            expires_at: String::new(),
        },
    }
}

#[async_trait]
impl OffsetCatalog for JsonFileCatalog {
    async fn list_tracked(&self) -> Result<RowStream> {
        let doc = self.load().await?;
        Ok(stream::iter(doc.objects.into_iter().map(Ok)).boxed())
    }

    async fn advance_offset(&self, source_id: &str, new_offset: u64) -> Result<()> {
        self.update_row(source_id, |row| {
            if new_offset < row.offset {
                return Err(format!(
                    "offset may not decrease ({} -> {})",
                    row.offset, new_offset
                ));
            }
            row.offset = new_offset;
            row.pending = None;
            Ok(())
        })
        .await
    }

    async fn mark_pending(&self, source_id: &str, marker: &ExportMarker) -> Result<()> {
        self.update_row(source_id, |row| {
            row.pending = Some(marker.clone());
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl LeaseProvider for JsonFileCatalog {
    async fn acquire(&self, owner: &str, ttl: Duration) -> Result<Lease> {
        let _guard = self.lock().await?;
        let now = Utc::now();

        // An existing lease is taken over only once it has lapsed or is unreadable
        if let Some(existing) = self.current_lease().await? {
            if !existing.is_expired(now) {
                return Err(lease_lost(Some(existing)));
            }
            tracing::warn!(
                holder = %existing.owner,
                expired_at = %existing.expires_at,
                "Taking over expired pass lease"
            );
        }

        let lease = Lease::grant(owner, ttl, now);
        self.write_lease(&lease).await?;
        Ok(lease)
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let _guard = self.lock().await?;
        match self.current_lease().await? {
            Some(current) if current.token == lease.token => {
                let renewed = current.renewed(ttl, Utc::now());
                self.write_lease(&renewed).await?;
                Ok(renewed)
            }
            other => Err(lease_lost(other)),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let _guard = self.lock().await?;
        match self.current_lease().await? {
            Some(current) if current.token == lease.token => {
                match tokio::fs::remove_file(&self.lease_path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(DeltaCopyError::io(&self.lease_path, e)),
                }
            }
            Some(current) => {
                tracing::warn!(holder = %current.owner, "Pass lease was taken over before release");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
