//! Pass progress reporter
//!
//! Uses an indicatif spinner showing rows processed, deltas exported and
//! bytes exported while a pass runs. The row count of a catalog is not known
//! up front, so no bar length or ETA is shown.

use crate::sync::RowOutcome;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Progress reporter for export passes
pub struct PassProgress {
    /// Status spinner
    spinner: ProgressBar,
    /// Start time
    start_time: Instant,
    /// Rows that reached a terminal state
    rows_done: AtomicU64,
    /// Rows that produced a delta
    rows_exported: AtomicU64,
    /// Rows that failed
    rows_failed: AtomicU64,
    /// Bytes exported so far
    bytes_exported: AtomicU64,
    /// Is progress enabled
    enabled: AtomicBool,
}

impl PassProgress {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(120));

        Self {
            spinner,
            start_time: Instant::now(),
            rows_done: AtomicU64::new(0),
            rows_exported: AtomicU64::new(0),
            rows_failed: AtomicU64::new(0),
            bytes_exported: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Create a disabled progress reporter (for quiet mode)
    pub fn disabled() -> Self {
        let reporter = Self::new();
        reporter.enabled.store(false, Ordering::SeqCst);
        reporter.spinner.disable_steady_tick();
        reporter.spinner.set_draw_target(ProgressDrawTarget::hidden());
        reporter
    }

    /// Record a finished row
    pub fn row_finished(&self, outcome: &RowOutcome) {
        self.rows_done.fetch_add(1, Ordering::Relaxed);
        match outcome {
            RowOutcome::Exported { start, end, .. } => {
                self.rows_exported.fetch_add(1, Ordering::Relaxed);
                self.bytes_exported.fetch_add(end - start, Ordering::Relaxed);
            }
            RowOutcome::Failed { .. } => {
                self.rows_failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        self.refresh();
    }

    fn refresh(&self) {
        if !self.is_enabled() {
            return;
        }
        self.spinner.set_message(format!(
            "{} rows checked, {} exported ({}), {} failed",
            self.rows_done.load(Ordering::Relaxed),
            self.rows_exported.load(Ordering::Relaxed),
            humansize::format_size(self.bytes_exported.load(Ordering::Relaxed), humansize::BINARY),
            self.rows_failed.load(Ordering::Relaxed),
        ));
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Rows finished so far
    pub fn rows_done(&self) -> u64 {
        self.rows_done.load(Ordering::Relaxed)
    }

    /// Bytes exported so far
    pub fn bytes_exported(&self) -> u64 {
        self.bytes_exported.load(Ordering::Relaxed)
    }

    /// Finish progress with a final message
    pub fn finish(&self, success: bool) {
        let mark = if success { "✓" } else { "✗" };
        self.spinner.finish_with_message(format!(
            "{} {} rows in {:.1?}",
            mark,
            self.rows_done(),
            self.elapsed()
        ));
    }

    /// Check if progress is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Default for PassProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Stage;

    #[test]
    fn test_counts_outcomes() {
        let progress = PassProgress::disabled();

        progress.row_finished(&RowOutcome::Unchanged { size: 10 });
        progress.row_finished(&RowOutcome::Exported {
            target_id: "mem://out/a_20240101000000".into(),
            start: 100,
            end: 150,
        });
        progress.row_finished(&RowOutcome::Failed {
            stage: Stage::Export,
            error: "boom".into(),
            target_id: None,
        });

        assert_eq!(progress.rows_done(), 3);
        assert_eq!(progress.bytes_exported(), 50);
        assert!(!progress.is_enabled());
    }
}
