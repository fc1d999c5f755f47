//! Sync orchestrator
//!
//! Drives one pass over the catalog. Each row is handled independently:
//!
//! 1. check that the source exists (missing sources are skipped with a warning)
//! 2. read its size; nothing happens unless it grew past the stored offset
//! 3. record a pending-export marker in the catalog
//! 4. range-copy `[offset, size)` into a freshly named delta object
//! 5. advance the stored offset to `size`
//!
//! Steps 4 and 5 write to two different systems without a shared
//! transaction. If step 5 fails the delta exists but the offset does not
//! move, and the next pass exports the same bytes again: delivery is
//! at-least-once and consumers must tolerate duplicate ranges.
//!
//! While a pass runs, its lease is renewed every third of the lease TTL. If
//! renewal finds the lease taken over, rows not yet started are deferred.

use crate::catalog::{
    ExportMarker, JsonFileCatalog, Lease, LeaseProvider, MemoryCatalog, OffsetCatalog, TrackedObject,
};
use crate::config::{CatalogConnection, StorageConnection, SyncConfig};
use crate::error::{DeltaCopyError, Result};
use crate::progress::PassProgress;
use crate::storage::{BlobStore, LocalBlobStore, MemoryBlobStore, ObjectUri, Throttled};
use crate::sync::naming::derive_target;
use crate::sync::report::{PassReport, RowOutcome, RowReport, Stage};
use chrono::{DateTime, Utc};
use futures::future::{self, Future};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Floor for the lease renewal period
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Source of export timestamps
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Coordinates catalog, inspector, namer and exporter for one pass at a time
pub struct SyncOrchestrator {
    config: SyncConfig,
    catalog: Arc<dyn OffsetCatalog>,
    store: Arc<dyn BlobStore>,
    leases: Option<Arc<dyn LeaseProvider>>,
    clock: Clock,
    cancelled: Arc<AtomicBool>,
    progress: Option<Arc<PassProgress>>,
}

impl SyncOrchestrator {
    /// Create an orchestrator over explicit backends. No lease is used until
    /// [`SyncOrchestrator::with_lease_provider`] is called.
    pub fn new(
        config: SyncConfig,
        catalog: Arc<dyn OffsetCatalog>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            config,
            catalog,
            store,
            leases: None,
            clock: Arc::new(Utc::now),
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Open the backends named in `config`
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        config.validate()?;

        let store = open_store(&config.storage, config.requests_per_second).await?;
        let (catalog, leases) = match &config.catalog {
            CatalogConnection::JsonFile { path } => {
                let catalog = Arc::new(JsonFileCatalog::open(path));
                (
                    catalog.clone() as Arc<dyn OffsetCatalog>,
                    catalog as Arc<dyn LeaseProvider>,
                )
            }
            CatalogConnection::Memory => {
                let catalog = Arc::new(MemoryCatalog::new());
                (
                    catalog.clone() as Arc<dyn OffsetCatalog>,
                    catalog as Arc<dyn LeaseProvider>,
                )
            }
        };

        let use_lease = config.use_lease;
        let orchestrator = Self::new(config, catalog, store);
        Ok(if use_lease {
            orchestrator.with_lease_provider(leases)
        } else {
            orchestrator
        })
    }

    /// Guard every pass with a lease from `provider`
    pub fn with_lease_provider(mut self, provider: Arc<dyn LeaseProvider>) -> Self {
        self.leases = Some(provider);
        self
    }

    /// Use `clock` for export timestamps
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Share a cancellation flag; once set, rows not yet started are deferred
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    /// Report row completions to a progress display
    pub fn with_progress(mut self, progress: Arc<PassProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Stop starting new rows
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Configuration in use
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one full pass over the catalog.
    ///
    /// Row failures are recorded in the report and never abort the pass.
    /// An error is returned only when the pass as a whole cannot run: the
    /// lease is held elsewhere or the catalog cannot be enumerated. Rows
    /// committed before an enumeration error stay committed.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let started_at = (self.clock)();
        info!(target_namespace = %self.config.target_namespace, "Pass starting");

        let lease_lost = AtomicBool::new(false);
        let pass = self.process_catalog(started_at, &lease_lost);

        let result = match &self.leases {
            Some(provider) => {
                let mut lease = provider
                    .acquire(&self.config.lease_owner, self.config.lease_ttl)
                    .await?;
                let result = self
                    .hold_lease(provider.as_ref(), &mut lease, pass, &lease_lost)
                    .await;
                if let Err(e) = provider.release(&lease).await {
                    warn!(owner = %lease.owner, "Failed to release pass lease: {}", e);
                }
                result
            }
            None => pass.await,
        };

        let report = result?;
        info!(
            checked = report.checked(),
            exported = report.exported,
            unchanged = report.unchanged,
            not_found = report.not_found,
            failed = report.failed,
            deferred = report.deferred,
            bytes = report.bytes_exported,
            "Pass completed"
        );
        Ok(report)
    }

    /// Drive `pass` to completion, renewing `lease` every third of its TTL.
    /// Sets `lost` once the lease can no longer be held.
    async fn hold_lease<F>(
        &self,
        provider: &dyn LeaseProvider,
        lease: &mut Lease,
        pass: F,
        lost: &AtomicBool,
    ) -> Result<PassReport>
    where
        F: Future<Output = Result<PassReport>>,
    {
        let ttl = self.config.lease_ttl;
        let period = (ttl / 3).max(MIN_RENEW_INTERVAL);
        let mut renewals = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renewals.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(pass);
        loop {
            tokio::select! {
                result = &mut pass => return result,
                _ = renewals.tick(), if !lost.load(Ordering::SeqCst) => {
                    match provider.renew(lease, ttl).await {
                        Ok(renewed) => {
                            debug!(owner = %renewed.owner, expires_at = %renewed.expires_at, "Renewed pass lease");
                            *lease = renewed;
                        }
                        Err(e @ DeltaCopyError::LeaseHeld { .. }) => {
                            error!("Pass lease lost; remaining rows deferred: {}", e);
                            lost.store(true, Ordering::SeqCst);
                        }
                        Err(e) if lease.is_expired(Utc::now()) => {
                            error!("Pass lease expired before renewal; remaining rows deferred: {}", e);
                            lost.store(true, Ordering::SeqCst);
                        }
                        Err(e) => warn!("Failed to renew pass lease, retrying: {}", e),
                    }
                }
            }
        }
    }

    async fn process_catalog(
        &self,
        started_at: DateTime<Utc>,
        lease_lost: &AtomicBool,
    ) -> Result<PassReport> {
        let rows = self.catalog.list_tracked().await?;
        let deadline = self.config.pass_timeout.map(|timeout| Instant::now() + timeout);

        // nothing is pulled from the catalog after an enumeration error
        let rows = rows.scan(false, |failed, row| {
            if *failed {
                return future::ready(None);
            }
            *failed = row.is_err();
            future::ready(Some(row))
        });

        let results: Vec<Result<RowReport>> = rows
            .map(|row| async move {
                let row = row?;
                let report = if self.should_stop(deadline, lease_lost) {
                    info!(source_id = %row.source_id, "Deferred to next pass");
                    RowReport {
                        source_id: row.source_id,
                        offset_before: row.offset,
                        outcome: RowOutcome::Deferred,
                        previous_attempt: None,
                        duration_ms: 0,
                    }
                } else {
                    self.process_row(row).await
                };
                if let Some(progress) = &self.progress {
                    progress.row_finished(&report.outcome);
                }
                Ok::<_, DeltaCopyError>(report)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = PassReport::new(started_at);
        let mut catalog_error = None;
        for result in results {
            match result {
                Ok(row) => report.record(row),
                Err(e) => {
                    error!(source_id = e.source_id().unwrap_or("-"), "Catalog enumeration failed: {}", e);
                    catalog_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = catalog_error {
            return Err(e);
        }

        report.finished_at = (self.clock)();
        Ok(report)
    }

    fn should_stop(&self, deadline: Option<Instant>, lease_lost: &AtomicBool) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || lease_lost.load(Ordering::SeqCst)
            || deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Run the per-row procedure and report its terminal state
    async fn process_row(&self, row: TrackedObject) -> RowReport {
        let started = Instant::now();
        let TrackedObject { source_id, offset, pending } = row;

        let previous_attempt = pending
            .filter(|marker| marker.start == offset)
            .map(|marker| marker.target_id);
        if let Some(previous) = &previous_attempt {
            warn!(
                source_id = %source_id,
                previous_target = %previous,
                "Earlier export of this range was never committed; a duplicate delta may exist"
            );
        }

        let outcome = self.export_if_grown(&source_id, offset).await;

        RowReport {
            source_id,
            offset_before: offset,
            outcome,
            previous_attempt,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn export_if_grown(&self, source_id: &str, offset: u64) -> RowOutcome {
        info!(source_id = %source_id, offset, "Checking object");

        let source = match ObjectUri::parse(source_id) {
            Ok(uri) => uri,
            Err(e) => return failed(source_id, Stage::Inspect, e, None),
        };

        match self.store.exists(&source).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(source_id = %source_id, "Object not found");
                return RowOutcome::NotFound;
            }
            Err(e) => return failed(source_id, Stage::Inspect, e, None),
        }

        let size = match self.store.size(&source).await {
            Ok(size) => size,
            Err(e) => return failed(source_id, Stage::Inspect, e, None),
        };

        if size <= offset {
            if size < offset {
                warn!(
                    source_id = %source_id,
                    offset,
                    size,
                    "Object is smaller than the exported offset; leaving offset unchanged"
                );
            }
            info!(source_id = %source_id, size, "No change");
            return RowOutcome::Unchanged { size };
        }

        let length = size - offset;
        let now = (self.clock)();
        let target = derive_target(&self.config.target_namespace, &source, now);
        let target_id = target.to_string();

        let marker = ExportMarker {
            target_id: target_id.clone(),
            start: offset,
            end: size,
            started_at: now,
        };
        if let Err(e) = self.catalog.mark_pending(source_id, &marker).await {
            return failed(source_id, Stage::Mark, e, None);
        }

        if let Err(e) = self.store.export_range(&source, &target, offset, length).await {
            return failed(source_id, Stage::Export, e, None);
        }

        if let Err(e) = self.catalog.advance_offset(source_id, size).await {
            error!(
                source_id = %source_id,
                target_id = %target_id,
                start = offset,
                end = size,
                "Delta exported but offset not advanced; the next pass will export this range again"
            );
            return failed(source_id, Stage::Commit, e, Some(target_id));
        }

        info!(
            source_id = %source_id,
            target_id = %target_id,
            start = offset,
            end = size,
            bytes = length,
            "Exported {}",
            humansize::format_size(length, humansize::BINARY)
        );
        RowOutcome::Exported {
            target_id,
            start: offset,
            end: size,
        }
    }
}

fn failed(source_id: &str, stage: Stage, error: DeltaCopyError, target_id: Option<String>) -> RowOutcome {
    error!(
        source_id = %source_id,
        stage = ?stage,
        recoverable = error.is_recoverable(),
        "Row failed: {}",
        error
    );
    RowOutcome::Failed {
        stage,
        error: error.to_string(),
        target_id,
    }
}

/// Open the storage backend for `connection`, rate limited if requested
pub async fn open_store(
    connection: &StorageConnection,
    requests_per_second: Option<u32>,
) -> Result<Arc<dyn BlobStore>> {
    fn finish<S: BlobStore + 'static>(store: S, rps: Option<u32>) -> Arc<dyn BlobStore> {
        match rps {
            Some(rps) => Arc::new(Throttled::new(store, rps)),
            None => Arc::new(store),
        }
    }

    match connection {
        StorageConnection::Local { root } => Ok(finish(LocalBlobStore::new(root), requests_per_second)),
        StorageConnection::Memory => Ok(finish(MemoryBlobStore::new(), requests_per_second)),
        #[cfg(feature = "native_s3")]
        StorageConnection::S3 { region, endpoint_url, force_path_style, max_retries } => {
            let config = crate::storage::S3StoreConfig {
                region: region.clone(),
                endpoint_url: endpoint_url.clone(),
                force_path_style: *force_path_style,
                max_retries: *max_retries,
                ..Default::default()
            };
            let store = crate::storage::S3BlobStore::new(config).await?;
            Ok(finish(store, requests_per_second))
        }
        #[cfg(not(feature = "native_s3"))]
        StorageConnection::S3 { .. } => Err(DeltaCopyError::config(
            "S3 storage requires building with the native_s3 feature",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RowStream;
    use crate::storage::{RangeExporter, SourceInspector, TargetNamespace};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use futures::{stream, TryStreamExt};
    use proptest::prelude::*;
    use std::sync::Mutex;

    struct Harness {
        catalog: Arc<MemoryCatalog>,
        store: Arc<MemoryBlobStore>,
        now: Arc<Mutex<DateTime<Utc>>>,
        orchestrator: SyncOrchestrator,
    }

    impl Harness {
        fn new(rows: &[(&str, u64)]) -> Self {
            Self::with_store(rows, |config| config, |store| store as Arc<dyn BlobStore>)
        }

        fn with_config(rows: &[(&str, u64)], configure: impl FnOnce(SyncConfig) -> SyncConfig) -> Self {
            Self::with_store(rows, configure, |store| store as Arc<dyn BlobStore>)
        }

        fn with_store(
            rows: &[(&str, u64)],
            configure: impl FnOnce(SyncConfig) -> SyncConfig,
            wrap: impl FnOnce(Arc<MemoryBlobStore>) -> Arc<dyn BlobStore>,
        ) -> Self {
            let catalog = Arc::new(MemoryCatalog::with_rows(rows.iter().copied()));
            let store = Arc::new(MemoryBlobStore::new());
            let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()));

            let mut config = SyncConfig::new(
                TargetNamespace::parse("mem://deltas").unwrap(),
                CatalogConnection::Memory,
                StorageConnection::Memory,
            );
            config.concurrency = 4;
            let config = configure(config);

            let clock = now.clone();
            let orchestrator = SyncOrchestrator::new(config, catalog.clone(), wrap(store.clone()))
                .with_lease_provider(catalog.clone())
                .with_clock(move || *clock.lock().unwrap());

            Self { catalog, store, now, orchestrator }
        }

        fn advance_clock(&self, secs: i64) {
            *self.now.lock().unwrap() += chrono::Duration::seconds(secs);
        }

        fn grow(&self, source: &str, bytes: &[u8]) {
            self.store.append(&ObjectUri::parse(source).unwrap(), bytes);
        }

        fn content(&self, id: &str) -> Option<Vec<u8>> {
            self.store.get(&ObjectUri::parse(id).unwrap())
        }

        async fn pass(&self) -> PassReport {
            let report = self.orchestrator.run_pass().await.unwrap();
            self.advance_clock(60);
            report
        }
    }

    fn bytes(range: std::ops::Range<u32>) -> Vec<u8> {
        range.map(|i| (i % 251) as u8).collect()
    }

    /// Memory store whose range copies take `delay`
    struct SlowStore {
        inner: Arc<MemoryBlobStore>,
        delay: Duration,
    }

    #[async_trait]
    impl SourceInspector for SlowStore {
        async fn exists(&self, source: &ObjectUri) -> Result<bool> {
            self.inner.exists(source).await
        }

        async fn size(&self, source: &ObjectUri) -> Result<u64> {
            self.inner.size(source).await
        }
    }

    #[async_trait]
    impl RangeExporter for SlowStore {
        async fn export_range(
            &self,
            source: &ObjectUri,
            target: &ObjectUri,
            start: u64,
            length: u64,
        ) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.export_range(source, target, start, length).await
        }
    }

    impl BlobStore for SlowStore {
        fn scheme(&self) -> &str {
            self.inner.scheme()
        }
    }

    fn slow(delay: Duration) -> impl FnOnce(Arc<MemoryBlobStore>) -> Arc<dyn BlobStore> {
        move |inner| Arc::new(SlowStore { inner, delay }) as Arc<dyn BlobStore>
    }

    /// Catalog whose enumeration breaks after `good_rows` rows
    struct BrokenListing {
        inner: MemoryCatalog,
        good_rows: usize,
    }

    #[async_trait]
    impl OffsetCatalog for BrokenListing {
        async fn list_tracked(&self) -> Result<RowStream> {
            let rows: Vec<TrackedObject> = self.inner.list_tracked().await?.try_collect().await?;
            let mut items: Vec<Result<TrackedObject>> = rows.into_iter().map(Ok).collect();
            items.insert(
                self.good_rows,
                Err(DeltaCopyError::CatalogUnavailable("connection reset".into())),
            );
            Ok(stream::iter(items).boxed())
        }

        async fn advance_offset(&self, source_id: &str, new_offset: u64) -> Result<()> {
            self.inner.advance_offset(source_id, new_offset).await
        }

        async fn mark_pending(&self, source_id: &str, marker: &ExportMarker) -> Result<()> {
            self.inner.mark_pending(source_id, marker).await
        }
    }

    #[tokio::test]
    async fn test_end_to_end_three_passes() {
        let h = Harness::new(&[("mem://in/A", 0)]);
        h.store.put(&ObjectUri::parse("mem://in/A").unwrap(), Vec::new());

        let first = h.pass().await;
        assert_eq!(first.unchanged, 1);
        assert_eq!(h.catalog.offset("mem://in/A"), Some(0));
        assert!(h.store.exports().is_empty());

        h.grow("mem://in/A", &bytes(0..1000));
        let second = h.pass().await;
        assert_eq!(second.exported, 1);
        let row = second.row("mem://in/A").unwrap();
        assert_eq!(
            row.outcome,
            RowOutcome::Exported {
                target_id: "mem://deltas/A_20240501100100".into(),
                start: 0,
                end: 1000,
            }
        );
        assert_eq!(h.content("mem://deltas/A_20240501100100").unwrap(), bytes(0..1000));
        assert_eq!(h.catalog.offset("mem://in/A"), Some(1000));

        let third = h.pass().await;
        assert_eq!(third.unchanged, 1);
        assert_eq!(h.store.exports().len(), 1);
        assert_eq!(h.catalog.offset("mem://in/A"), Some(1000));
    }

    #[tokio::test]
    async fn test_unchanged_size_has_no_side_effects() {
        let h = Harness::new(&[("mem://in/a.log", 5)]);
        h.grow("mem://in/a.log", b"hello");

        let report = h.pass().await;
        assert_eq!(report.row("mem://in/a.log").unwrap().outcome, RowOutcome::Unchanged { size: 5 });
        assert_eq!(h.catalog.advance_count(), 0);
        assert_eq!(h.catalog.mark_count(), 0);
        assert!(h.store.list("mem://deltas/").is_empty());
    }

    #[tokio::test]
    async fn test_exports_exact_appended_bytes() {
        let h = Harness::new(&[("mem://in/logs/app.log", 100)]);
        h.grow("mem://in/logs/app.log", &bytes(0..173));

        let report = h.pass().await;
        let target = match &report.row("mem://in/logs/app.log").unwrap().outcome {
            RowOutcome::Exported { target_id, start, end } => {
                assert_eq!((*start, *end), (100, 173));
                target_id.clone()
            }
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(target.starts_with("mem://deltas/logs/app.log_"));
        assert_eq!(h.content(&target).unwrap(), bytes(100..173));
        assert!(h.catalog.row("mem://in/logs/app.log").unwrap().pending.is_none());
    }

    #[tokio::test]
    async fn test_missing_source_is_non_fatal() {
        let h = Harness::new(&[("mem://in/gone.log", 10), ("mem://in/ok.log", 0)]);
        h.grow("mem://in/ok.log", b"data");

        let report = h.pass().await;
        assert!(report.is_success());
        assert_eq!(report.not_found, 1);
        assert_eq!(report.exported, 1);
        assert_eq!(h.catalog.offset("mem://in/gone.log"), Some(10));
    }

    #[tokio::test]
    async fn test_row_failures_are_isolated() {
        let h = Harness::new(&[
            ("mem://in/a.log", 0),
            ("mem://in/b.log", 0),
            ("mem://in/c.log", 0),
            ("mem://in/d.log", 0),
        ]);
        for id in ["mem://in/a.log", "mem://in/b.log", "mem://in/c.log", "mem://in/d.log"] {
            h.grow(id, b"0123456789");
        }
        h.store.fail_inspect(&ObjectUri::parse("mem://in/b.log").unwrap());
        h.store.fail_export(&ObjectUri::parse("mem://in/c.log").unwrap());

        let report = h.pass().await;
        assert!(!report.is_success());
        assert_eq!(report.failed, 2);
        assert_eq!(report.exported, 2);

        let stage_of = |id: &str| match &report.row(id).unwrap().outcome {
            RowOutcome::Failed { stage, .. } => Some(*stage),
            _ => None,
        };
        assert_eq!(stage_of("mem://in/b.log"), Some(Stage::Inspect));
        assert_eq!(stage_of("mem://in/c.log"), Some(Stage::Export));

        assert_eq!(h.catalog.offset("mem://in/a.log"), Some(10));
        assert_eq!(h.catalog.offset("mem://in/b.log"), Some(0));
        assert_eq!(h.catalog.offset("mem://in/c.log"), Some(0));
        assert_eq!(h.catalog.offset("mem://in/d.log"), Some(10));
    }

    #[tokio::test]
    async fn test_commit_failure_reexports_range() {
        let h = Harness::new(&[("mem://in/s.log", 100)]);
        h.grow("mem://in/s.log", &bytes(0..150));
        h.catalog.fail_advance_for("mem://in/s.log");

        let first = h.pass().await;
        let first_target = match &first.row("mem://in/s.log").unwrap().outcome {
            RowOutcome::Failed { stage: Stage::Commit, target_id: Some(target), .. } => target.clone(),
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(h.content(&first_target).unwrap(), bytes(100..150));
        assert_eq!(h.catalog.offset("mem://in/s.log"), Some(100));

        // source grows further before the retry
        h.catalog.clear_failures();
        h.grow("mem://in/s.log", &bytes(150..200));

        let second = h.pass().await;
        let row = second.row("mem://in/s.log").unwrap();
        assert_eq!(row.previous_attempt.as_deref(), Some(first_target.as_str()));
        match &row.outcome {
            RowOutcome::Exported { target_id, start, end } => {
                assert_ne!(target_id, &first_target);
                assert_eq!((*start, *end), (100, 200));
                assert_eq!(h.content(target_id).unwrap(), bytes(100..200));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.catalog.offset("mem://in/s.log"), Some(200));
        assert_eq!(h.store.exports().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_failure_same_size_reexports_same_range() {
        let h = Harness::new(&[("mem://in/s.log", 100)]);
        h.grow("mem://in/s.log", &bytes(0..150));
        h.catalog.fail_advance_for("mem://in/s.log");
        h.pass().await;

        h.catalog.clear_failures();
        h.pass().await;

        let exports = h.store.exports();
        assert_eq!(exports.len(), 2);
        assert!(exports.iter().all(|e| e.start == 100 && e.length == 50));
        assert_ne!(exports[0].target, exports[1].target);
    }

    #[tokio::test]
    async fn test_shrunk_source_keeps_offset() {
        let h = Harness::new(&[("mem://in/a.log", 50)]);
        h.grow("mem://in/a.log", b"short");

        let report = h.pass().await;
        assert_eq!(report.unchanged, 1);
        assert_eq!(h.catalog.offset("mem://in/a.log"), Some(50));
    }

    #[tokio::test]
    async fn test_invalid_source_id_fails_row() {
        let h = Harness::new(&[("not a uri", 0), ("mem://in/a.log", 0)]);
        h.grow("mem://in/a.log", b"x");

        let report = h.pass().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.exported, 1);
    }

    #[tokio::test]
    async fn test_catalog_unavailable_aborts_pass_and_releases_lease() {
        let h = Harness::new(&[("mem://in/a.log", 0)]);
        h.catalog.set_unavailable(true);

        let err = h.orchestrator.run_pass().await.unwrap_err();
        assert!(matches!(err, DeltaCopyError::CatalogUnavailable(_)));
        assert!(h.catalog.current_lease().is_none());
    }

    #[tokio::test]
    async fn test_held_lease_blocks_pass() {
        let h = Harness::new(&[("mem://in/a.log", 0)]);
        h.grow("mem://in/a.log", b"abc");
        let other = h.catalog.acquire("other-host:1", Duration::from_secs(600)).await.unwrap();

        let err = h.orchestrator.run_pass().await.unwrap_err();
        assert!(matches!(err, DeltaCopyError::LeaseHeld { .. }));
        assert!(h.store.exports().is_empty());

        h.catalog.release(&other).await.unwrap();
        assert_eq!(h.pass().await.exported, 1);
        assert!(h.catalog.current_lease().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_pass_defers_rows() {
        let h = Harness::new(&[("mem://in/a.log", 0), ("mem://in/b.log", 0)]);
        h.grow("mem://in/a.log", b"abc");
        h.grow("mem://in/b.log", b"abc");
        h.orchestrator.cancel();

        let report = h.pass().await;
        assert_eq!(report.deferred, 2);
        assert!(report.is_success());
        assert!(h.store.exports().is_empty());
        assert_eq!(h.catalog.offset("mem://in/a.log"), Some(0));
    }

    #[tokio::test]
    async fn test_marker_failure_skips_export() {
        let h = Harness::new(&[("mem://in/a.log", 3)]);
        h.grow("mem://in/a.log", b"0123456789");
        h.catalog.fail_mark_for("mem://in/a.log");

        let report = h.pass().await;
        match &report.row("mem://in/a.log").unwrap().outcome {
            RowOutcome::Failed { stage: Stage::Mark, target_id: None, .. } => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(h.store.exports().is_empty());
        assert!(h.store.list("mem://deltas/").is_empty());
        assert_eq!(h.catalog.offset("mem://in/a.log"), Some(3));
        assert_eq!(h.catalog.mark_count(), 0);
        assert_eq!(h.catalog.advance_count(), 0);
    }

    #[tokio::test]
    async fn test_elapsed_deadline_defers_every_row() {
        let h = Harness::with_config(&[("mem://in/a.log", 0), ("mem://in/b.log", 0)], |mut config| {
            config.pass_timeout = Some(Duration::ZERO);
            config
        });
        h.grow("mem://in/a.log", b"abc");
        h.grow("mem://in/b.log", b"abc");

        let report = h.pass().await;
        assert_eq!(report.deferred, 2);
        assert!(report
            .rows
            .iter()
            .all(|row| row.outcome == RowOutcome::Deferred));
        assert!(h.store.exports().is_empty());
        assert_eq!(h.catalog.offset("mem://in/a.log"), Some(0));
        assert_eq!(h.catalog.offset("mem://in/b.log"), Some(0));
    }

    #[tokio::test]
    async fn test_enumeration_error_keeps_earlier_commits() {
        let inner = MemoryCatalog::with_rows([("mem://in/a.log", 0), ("mem://in/b.log", 0), ("mem://in/c.log", 0)]);
        let catalog = Arc::new(BrokenListing { inner, good_rows: 2 });
        let store = Arc::new(MemoryBlobStore::new());
        for id in ["mem://in/a.log", "mem://in/b.log", "mem://in/c.log"] {
            store.append(&ObjectUri::parse(id).unwrap(), b"payload");
        }

        let mut config = SyncConfig::new(
            TargetNamespace::parse("mem://deltas").unwrap(),
            CatalogConnection::Memory,
            StorageConnection::Memory,
        );
        config.concurrency = 1;
        let orchestrator = SyncOrchestrator::new(config, catalog.clone(), store.clone());

        let err = orchestrator.run_pass().await.unwrap_err();
        assert!(matches!(err, DeltaCopyError::CatalogUnavailable(_)));
        assert_eq!(catalog.inner.offset("mem://in/a.log"), Some(7));
        assert_eq!(catalog.inner.offset("mem://in/b.log"), Some(7));
        assert_eq!(catalog.inner.offset("mem://in/c.log"), Some(0));
        assert_eq!(store.exports().len(), 2);
    }

    #[tokio::test]
    async fn test_lease_renewed_during_long_pass() {
        let h = Harness::with_store(
            &[("mem://in/a.log", 0)],
            |mut config| {
                config.lease_ttl = Duration::from_millis(300);
                config
            },
            slow(Duration::from_millis(900)),
        );
        h.grow("mem://in/a.log", b"abc");

        let intruder = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            h.catalog.acquire("other-host:2", Duration::from_secs(600)).await
        };
        let (report, intrusion) = tokio::join!(h.orchestrator.run_pass(), intruder);

        assert!(matches!(intrusion, Err(DeltaCopyError::LeaseHeld { .. })));
        assert_eq!(report.unwrap().exported, 1);
        assert!(h.catalog.renew_count() >= 2);
        assert!(h.catalog.current_lease().is_none());
    }

    #[tokio::test]
    async fn test_lost_lease_defers_remaining_rows() {
        let h = Harness::with_store(
            &[("mem://in/a.log", 0), ("mem://in/b.log", 0), ("mem://in/c.log", 0)],
            |mut config| {
                config.concurrency = 1;
                config.lease_ttl = Duration::from_millis(300);
                config
            },
            slow(Duration::from_millis(400)),
        );
        for id in ["mem://in/a.log", "mem://in/b.log", "mem://in/c.log"] {
            h.grow(id, b"abc");
        }

        let takeover = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            h.catalog.take_over_lease("other-host:2", Duration::from_secs(600))
        };
        let (report, successor) = tokio::join!(h.orchestrator.run_pass(), takeover);
        let report = report.unwrap();

        assert_eq!(report.exported, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(h.store.exports().len(), 1);
        assert_eq!(h.catalog.current_lease(), Some(successor));
    }

    #[tokio::test]
    async fn test_connect_memory_backends() {
        let config = SyncConfig::new(
            TargetNamespace::parse("mem://deltas").unwrap(),
            CatalogConnection::Memory,
            StorageConnection::Memory,
        );
        let orchestrator = SyncOrchestrator::connect(config).await.unwrap();
        let report = orchestrator.run_pass().await.unwrap();
        assert_eq!(report.checked(), 0);
    }

    #[tokio::test]
    async fn test_local_backend_pass() {
        let dir = tempfile::TempDir::new().unwrap();
        let blobs = dir.path().join("blobs");
        std::fs::create_dir_all(blobs.join("logs")).unwrap();
        std::fs::write(blobs.join("logs/app.log"), b"first line\n").unwrap();

        let catalog_path = dir.path().join("catalog.json");
        let catalog = JsonFileCatalog::create(&catalog_path).await.unwrap();
        catalog.track("local://logs/app.log", 0).await.unwrap();

        let config = SyncConfig::new(
            TargetNamespace::parse("local://deltas").unwrap(),
            CatalogConnection::JsonFile { path: catalog_path.clone() },
            StorageConnection::Local { root: blobs.clone() },
        );
        let orchestrator = SyncOrchestrator::connect(config)
            .await
            .unwrap()
            .with_clock(|| Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());

        let report = orchestrator.run_pass().await.unwrap();
        assert_eq!(report.exported, 1);
        assert_eq!(
            std::fs::read(blobs.join("deltas/app.log_20240102030405")).unwrap(),
            b"first line\n"
        );
        assert_eq!(catalog.rows().await.unwrap()[0].offset, 11);
        assert!(!dir.path().join("catalog.json.lease").exists());
    }

    proptest! {
        #[test]
        fn prop_offset_never_decreases(growth in proptest::collection::vec(0usize..64, 1..8)) {
            tokio_test::block_on(async {
                let h = Harness::new(&[("mem://in/p.log", 0)]);
                h.store.put(&ObjectUri::parse("mem://in/p.log").unwrap(), Vec::new());

                let mut last = 0u64;
                let mut total = 0usize;
                for step in growth {
                    h.grow("mem://in/p.log", &vec![7u8; step]);
                    total += step;
                    h.pass().await;

                    let offset = h.catalog.offset("mem://in/p.log").unwrap();
                    prop_assert!(offset >= last);
                    prop_assert_eq!(offset, total as u64);
                    last = offset;
                }

                let exported: u64 = h.store.exports().iter().map(|e| e.length).sum();
                prop_assert_eq!(exported, total as u64);
                Ok(())
            })?;
        }
    }
}
