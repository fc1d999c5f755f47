//! In-memory object store
//!
//! Backs embedded use and tests. Objects live in a map keyed by their
//! `mem://` identifier; failure hooks let callers simulate inspection and
//! export faults for individual objects.

use super::{BlobStore, ObjectUri, RangeExporter, SourceInspector};
use crate::error::{DeltaCopyError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// One recorded `export_range` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportCall {
    /// Source identifier
    pub source: String,
    /// Target identifier
    pub target: String,
    /// First byte copied
    pub start: u64,
    /// Number of bytes copied
    pub length: u64,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, Vec<u8>>,
    inspect_failures: HashSet<String>,
    export_failures: HashSet<String>,
    exports: Vec<ExportCall>,
}

/// Thread-safe in-memory blob store for the `mem` scheme
#[derive(Default)]
pub struct MemoryBlobStore {
    state: Mutex<MemoryState>,
}

impl MemoryBlobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create or replace an object
    pub fn put(&self, uri: &ObjectUri, data: Vec<u8>) {
        self.lock().objects.insert(uri.to_string(), data);
    }

    /// Append bytes to an object, creating it if missing
    pub fn append(&self, uri: &ObjectUri, data: &[u8]) {
        self.lock()
            .objects
            .entry(uri.to_string())
            .or_default()
            .extend_from_slice(data);
    }

    /// Delete an object
    pub fn remove(&self, uri: &ObjectUri) -> Option<Vec<u8>> {
        self.lock().objects.remove(&uri.to_string())
    }

    /// Read an object's content
    pub fn get(&self, uri: &ObjectUri) -> Option<Vec<u8>> {
        self.lock().objects.get(&uri.to_string()).cloned()
    }

    /// Identifiers of all objects starting with `prefix`, in sorted order
    pub fn list(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Make `exists`/`size` fail for this object
    pub fn fail_inspect(&self, uri: &ObjectUri) {
        self.lock().inspect_failures.insert(uri.to_string());
    }

    /// Make exports from this source fail
    pub fn fail_export(&self, uri: &ObjectUri) {
        self.lock().export_failures.insert(uri.to_string());
    }

    /// Remove all failure hooks
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.inspect_failures.clear();
        state.export_failures.clear();
    }

    /// All successful export calls, in call order
    pub fn exports(&self) -> Vec<ExportCall> {
        self.lock().exports.clone()
    }
}

#[async_trait]
impl SourceInspector for MemoryBlobStore {
    async fn exists(&self, source: &ObjectUri) -> Result<bool> {
        let key = source.to_string();
        let state = self.lock();
        if state.inspect_failures.contains(&key) {
            return Err(DeltaCopyError::source_unavailable(key, "injected inspect failure"));
        }
        Ok(state.objects.contains_key(&key))
    }

    async fn size(&self, source: &ObjectUri) -> Result<u64> {
        let key = source.to_string();
        let state = self.lock();
        if state.inspect_failures.contains(&key) {
            return Err(DeltaCopyError::source_unavailable(key, "injected inspect failure"));
        }
        state
            .objects
            .get(&key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| DeltaCopyError::source_unavailable(key, "object does not exist"))
    }
}

#[async_trait]
impl RangeExporter for MemoryBlobStore {
    async fn export_range(
        &self,
        source: &ObjectUri,
        target: &ObjectUri,
        start: u64,
        length: u64,
    ) -> Result<()> {
        let source_key = source.to_string();
        let target_key = target.to_string();
        let mut state = self.lock();

        if length == 0 {
            return Err(DeltaCopyError::export(source_key, target_key, "empty range"));
        }
        if state.export_failures.contains(&source_key) {
            return Err(DeltaCopyError::export(source_key, target_key, "injected export failure"));
        }
        if state.objects.contains_key(&target_key) {
            return Err(DeltaCopyError::export(source_key, target_key, "target already exists"));
        }

        let data = state
            .objects
            .get(&source_key)
            .ok_or_else(|| DeltaCopyError::export(&source_key, &target_key, "source does not exist"))?;
        let end = start
            .checked_add(length)
            .filter(|end| *end <= data.len() as u64)
            .ok_or_else(|| DeltaCopyError::export(&source_key, &target_key, "source truncated"))?;

        let delta = data[start as usize..end as usize].to_vec();
        state.objects.insert(target_key.clone(), delta);
        state.exports.push(ExportCall {
            source: source_key,
            target: target_key,
            start,
            length,
        });
        Ok(())
    }
}

impl BlobStore for MemoryBlobStore {
    fn scheme(&self) -> &str {
        "mem"
    }
}
