//! Local filesystem object store
//!
//! Maps `local://<container>/<key>` to `<root>/<container>/<key>`. Range
//! export uses `copy_file_range` on Linux so the bytes move inside the
//! kernel and never pass through this process; other platforms fall back
//! to a streaming seek-and-copy.

use super::{BlobStore, ObjectUri, RangeExporter, SourceInspector};
use crate::error::{DeltaCopyError, Result};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

/// URI scheme served by [`LocalBlobStore`]
pub const LOCAL_SCHEME: &str = "local";

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object identifier to its file path
    pub fn path_for(&self, uri: &ObjectUri) -> Result<PathBuf> {
        if uri.scheme() != LOCAL_SCHEME {
            return Err(DeltaCopyError::InvalidUri(format!(
                "{}: local store only serves {}://",
                uri, LOCAL_SCHEME
            )));
        }

        let relative = Path::new(uri.container()).join(uri.key());
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(DeltaCopyError::InvalidUri(format!(
                "{}: path escapes the store root",
                uri
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl SourceInspector for LocalBlobStore {
    async fn exists(&self, source: &ObjectUri) -> Result<bool> {
        let path = self.path_for(source)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DeltaCopyError::source_unavailable(source.to_string(), e)),
        }
    }

    async fn size(&self, source: &ObjectUri) -> Result<u64> {
        let path = self.path_for(source)?;
        tokio::fs::metadata(&path)
            .await
            .map(|meta| meta.len())
            .map_err(|e| DeltaCopyError::source_unavailable(source.to_string(), e))
    }
}

#[async_trait]
impl RangeExporter for LocalBlobStore {
    async fn export_range(
        &self,
        source: &ObjectUri,
        target: &ObjectUri,
        start: u64,
        length: u64,
    ) -> Result<()> {
        if length == 0 {
            return Err(DeltaCopyError::export(source.to_string(), target.to_string(), "empty range"));
        }

        let source_path = self.path_for(source)?;
        let target_path = self.path_for(target)?;

        let copied = tokio::task::spawn_blocking(move || {
            copy_range(&source_path, &target_path, start, length)
        })
        .await
        .map_err(|e| DeltaCopyError::export(source.to_string(), target.to_string(), e))?;

        match copied {
            Ok(n) if n == length => Ok(()),
            Ok(n) => Err(DeltaCopyError::export(
                source.to_string(),
                target.to_string(),
                format!("source truncated: copied {} of {} bytes", n, length),
            )),
            Err(e) => Err(DeltaCopyError::export(source.to_string(), target.to_string(), e)),
        }
    }
}

impl BlobStore for LocalBlobStore {
    fn scheme(&self) -> &str {
        LOCAL_SCHEME
    }
}

/// Copy `[start, start+length)` of `source` into the new file `target`.
///
/// The target is created exclusively and removed again if the copy comes up
/// short or fails.
fn copy_range(source: &Path, target: &Path, start: u64, length: u64) -> io::Result<u64> {
    let src = File::open(source)?;
    let available = src.metadata()?.len();
    if available < start.saturating_add(length) {
        return Ok(available.saturating_sub(start));
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dst = OpenOptions::new().write(true).create_new(true).open(target)?;

    let result = copy_file_range_all(&src, &dst, start, length).and_then(|n| {
        dst.sync_all()?;
        Ok(n)
    });

    match result {
        Ok(n) if n == length => Ok(n),
        other => {
            drop(dst);
            let _ = std::fs::remove_file(target);
            other
        }
    }
}

#[cfg(target_os = "linux")]
fn copy_file_range_all(src: &File, dst: &File, start: u64, length: u64) -> io::Result<u64> {
    use std::os::unix::io::AsRawFd;

    let src_fd = src.as_raw_fd();
    let dst_fd = dst.as_raw_fd();

    let mut offset_in = start as i64;
    let mut offset_out: i64 = 0;
    let mut total_copied: u64 = 0;

    while total_copied < length {
        let to_copy = (length - total_copied).min(isize::MAX as u64) as usize;

        let copied = unsafe {
            libc::copy_file_range(src_fd, &mut offset_in, dst_fd, &mut offset_out, to_copy, 0)
        };

        if copied < 0 {
            let err = io::Error::last_os_error();
            let unsupported = matches!(
                err.raw_os_error(),
                Some(libc::EXDEV) | Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP) | Some(libc::EINVAL)
            );
            if unsupported && total_copied == 0 {
                return copy_buffered(src, dst, start, length);
            }
            return Err(err);
        }

        if copied == 0 {
            break; // EOF
        }

        total_copied += copied as u64;
    }

    Ok(total_copied)
}

#[cfg(not(target_os = "linux"))]
fn copy_file_range_all(src: &File, dst: &File, start: u64, length: u64) -> io::Result<u64> {
    copy_buffered(src, dst, start, length)
}

fn copy_buffered(mut src: &File, mut dst: &File, start: u64, length: u64) -> io::Result<u64> {
    use std::io::{Read, Seek, SeekFrom};

    src.seek(SeekFrom::Start(start))?;
    dst.seek(SeekFrom::Start(0))?;
    io::copy(&mut src.take(length), &mut dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn uri(s: &str) -> ObjectUri {
        ObjectUri::parse(s).unwrap()
    }

    fn write_object(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_exists_and_size() {
        let dir = TempDir::new().unwrap();
        write_object(dir.path(), "logs/app/a.log", b"hello world");
        let store = LocalBlobStore::new(dir.path());

        let src = uri("local://logs/app/a.log");
        assert!(store.exists(&src).await.unwrap());
        assert_eq!(store.size(&src).await.unwrap(), 11);
        assert!(!store.exists(&uri("local://logs/app/missing.log")).await.unwrap());
    }

    #[tokio::test]
    async fn test_export_range_exact_bytes() {
        let dir = TempDir::new().unwrap();
        write_object(dir.path(), "logs/a.log", b"0123456789abcdef");
        let store = LocalBlobStore::new(dir.path());

        let src = uri("local://logs/a.log");
        let dst = uri("local://deltas/nested/a.log_20240101000000");
        store.export_range(&src, &dst, 10, 6).await.unwrap();

        let copied = std::fs::read(dir.path().join("deltas/nested/a.log_20240101000000")).unwrap();
        assert_eq!(copied, b"abcdef");
    }

    #[tokio::test]
    async fn test_export_refuses_existing_target() {
        let dir = TempDir::new().unwrap();
        write_object(dir.path(), "logs/a.log", b"0123");
        write_object(dir.path(), "deltas/a.log_1", b"keep");
        let store = LocalBlobStore::new(dir.path());

        let err = store
            .export_range(&uri("local://logs/a.log"), &uri("local://deltas/a.log_1"), 0, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, DeltaCopyError::Export { .. }));
        assert_eq!(std::fs::read(dir.path().join("deltas/a.log_1")).unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_export_truncated_source() {
        let dir = TempDir::new().unwrap();
        write_object(dir.path(), "logs/a.log", b"0123");
        let store = LocalBlobStore::new(dir.path());

        let err = store
            .export_range(&uri("local://logs/a.log"), &uri("local://deltas/a.log_1"), 2, 10)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("truncated"));
        assert!(!dir.path().join("deltas/a.log_1").exists());
    }

    #[test]
    fn test_path_for_rejects_escape_and_scheme() {
        let store = LocalBlobStore::new("/data");
        assert!(store.path_for(&uri("local://logs/../../etc/passwd")).is_err());
        assert!(store.path_for(&uri("s3://logs/a.log")).is_err());
        assert_eq!(
            store.path_for(&uri("local://logs/a/b.log")).unwrap(),
            PathBuf::from("/data/logs/a/b.log")
        );
    }
}
