//! In-memory catalog
//!
//! Rows are kept in insertion order. Failure hooks simulate an unreachable
//! catalog or rejected writes for individual rows, and write counters let
//! callers assert how many catalog mutations a pass performed.

use super::{ExportMarker, Lease, LeaseProvider, OffsetCatalog, RowStream, TrackedObject};
use crate::error::{DeltaCopyError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct CatalogState {
    rows: Vec<TrackedObject>,
    advance_failures: HashSet<String>,
    mark_failures: HashSet<String>,
    unavailable: bool,
    advances: u64,
    marks: u64,
    renewals: u64,
    lease: Option<Lease>,
}

/// Catalog held in process memory
#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog with the given rows
    pub fn with_rows<'a>(rows: impl IntoIterator<Item = (&'a str, u64)>) -> Self {
        let catalog = Self::new();
        for (id, offset) in rows {
            catalog.insert(id, offset);
        }
        catalog
    }

    fn lock(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a row
    pub fn insert(&self, source_id: &str, offset: u64) {
        let mut state = self.lock();
        match state.rows.iter_mut().find(|r| r.source_id == source_id) {
            Some(row) => *row = TrackedObject::new(source_id, offset),
            None => state.rows.push(TrackedObject::new(source_id, offset)),
        }
    }

    /// Stored row for a source
    pub fn row(&self, source_id: &str) -> Option<TrackedObject> {
        self.lock().rows.iter().find(|r| r.source_id == source_id).cloned()
    }

    /// Stored offset for a source
    pub fn offset(&self, source_id: &str) -> Option<u64> {
        self.row(source_id).map(|r| r.offset)
    }

    /// Reject offset advances for this source
    pub fn fail_advance_for(&self, source_id: &str) {
        self.lock().advance_failures.insert(source_id.to_string());
    }

    /// Reject pending markers for this source
    pub fn fail_mark_for(&self, source_id: &str) {
        self.lock().mark_failures.insert(source_id.to_string());
    }

    /// Make enumeration fail as if the catalog were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Remove all failure hooks
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.advance_failures.clear();
        state.mark_failures.clear();
        state.unavailable = false;
    }

    /// Number of successful offset advances
    pub fn advance_count(&self) -> u64 {
        self.lock().advances
    }

    /// Number of pending markers written
    pub fn mark_count(&self) -> u64 {
        self.lock().marks
    }

    /// Number of successful lease renewals
    pub fn renew_count(&self) -> u64 {
        self.lock().renewals
    }

    /// Currently held lease
    pub fn current_lease(&self) -> Option<Lease> {
        self.lock().lease.clone()
    }

    /// Hand the lease to another owner as if the holder had lapsed
    pub fn take_over_lease(&self, owner: &str, ttl: Duration) -> Lease {
        let lease = Lease::grant(owner, ttl, Utc::now());
        self.lock().lease = Some(lease.clone());
        lease
    }
}

#[async_trait]
impl OffsetCatalog for MemoryCatalog {
    async fn list_tracked(&self) -> Result<RowStream> {
        let state = self.lock();
        if state.unavailable {
            return Err(DeltaCopyError::CatalogUnavailable("memory catalog offline".into()));
        }
        let rows = state.rows.clone();
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn advance_offset(&self, source_id: &str, new_offset: u64) -> Result<()> {
        let mut state = self.lock();
        if state.advance_failures.contains(source_id) {
            return Err(DeltaCopyError::catalog_write(source_id, "injected write failure"));
        }

        let row = state
            .rows
            .iter_mut()
            .find(|r| r.source_id == source_id)
            .ok_or_else(|| DeltaCopyError::NotFound(source_id.to_string()))?;
        if new_offset < row.offset {
            return Err(DeltaCopyError::catalog_write(
                source_id,
                format!("offset may not decrease ({} -> {})", row.offset, new_offset),
            ));
        }
        row.offset = new_offset;
        row.pending = None;
        state.advances += 1;
        Ok(())
    }

    async fn mark_pending(&self, source_id: &str, marker: &ExportMarker) -> Result<()> {
        let mut state = self.lock();
        if state.mark_failures.contains(source_id) {
            return Err(DeltaCopyError::catalog_write(source_id, "injected marker failure"));
        }

        let row = state
            .rows
            .iter_mut()
            .find(|r| r.source_id == source_id)
            .ok_or_else(|| DeltaCopyError::NotFound(source_id.to_string()))?;
        row.pending = Some(marker.clone());
        state.marks += 1;
        Ok(())
    }
}

#[async_trait]
impl LeaseProvider for MemoryCatalog {
    async fn acquire(&self, owner: &str, ttl: Duration) -> Result<Lease> {
        let now = Utc::now();
        let mut state = self.lock();
        if let Some(held) = state.lease.as_ref().filter(|l| !l.is_expired(now)) {
            return Err(DeltaCopyError::LeaseHeld {
                holder: held.owner.clone(),
                expires_at: held.expires_at.to_rfc3339(),
            });
        }
        let lease = Lease::grant(owner, ttl, now);
        state.lease = Some(lease.clone());
        Ok(lease)
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let mut state = self.lock();
        match state.lease.clone() {
            Some(current) if current.token == lease.token => {
                let renewed = current.renewed(ttl, Utc::now());
                state.lease = Some(renewed.clone());
                state.renewals += 1;
                Ok(renewed)
            }
            current => Err(DeltaCopyError::LeaseHeld {
                holder: current.as_ref().map(|l| l.owner.clone()).unwrap_or_default(),
                expires_at: current.map(|l| l.expires_at.to_rfc3339()).unwrap_or_default(),
            }),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut state = self.lock();
        if state.lease.as_ref().map(|l| &l.token) == Some(&lease.token) {
            state.lease = None;
        }
        Ok(())
    }
}
