//! Pass diagnostics
//!
//! Every row of a pass ends in exactly one [`RowOutcome`]. The
//! [`PassReport`] collects them together with per-outcome counts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Step of the row procedure that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Existence or size query
    Inspect,
    /// Writing the pending-export marker
    Mark,
    /// Server-side range copy
    Export,
    /// Advancing the catalog offset after a successful export
    Commit,
}

/// Terminal state of one row in a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RowOutcome {
    /// Source did not grow past the stored offset
    Unchanged {
        /// Observed source size
        size: u64,
    },
    /// A delta covering `[start, end)` was exported and the offset advanced
    Exported {
        /// Delta object identifier
        target_id: String,
        /// Previous offset
        start: u64,
        /// New offset
        end: u64,
    },
    /// Source object does not exist
    NotFound,
    /// The row failed; the stored offset is unchanged
    Failed {
        /// Failing step
        stage: Stage,
        /// Error description
        error: String,
        /// Delta already written when the commit failed
        target_id: Option<String>,
    },
    /// Not started because the pass was cancelled or timed out
    Deferred,
}

impl RowOutcome {
    /// Short label for logs and summaries
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unchanged { .. } => "unchanged",
            Self::Exported { .. } => "exported",
            Self::NotFound => "not_found",
            Self::Failed { .. } => "failed",
            Self::Deferred => "deferred",
        }
    }
}

/// Diagnostics for one row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowReport {
    /// Source object identifier
    pub source_id: String,
    /// Stored offset when the row was read
    pub offset_before: u64,
    /// Terminal state
    #[serde(flatten)]
    pub outcome: RowOutcome,
    /// Target of an earlier export of this range that was never committed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_attempt: Option<String>,
    /// Time spent on the row
    pub duration_ms: u64,
}

/// Result of one pass over the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    /// Pass start
    pub started_at: DateTime<Utc>,
    /// Pass end
    pub finished_at: DateTime<Utc>,
    /// Per-row diagnostics, in completion order
    pub rows: Vec<RowReport>,
    /// Rows left untouched
    pub unchanged: usize,
    /// Rows that produced a delta
    pub exported: usize,
    /// Rows whose source is missing
    pub not_found: usize,
    /// Rows that failed
    pub failed: usize,
    /// Rows deferred to the next pass
    pub deferred: usize,
    /// Total bytes exported
    pub bytes_exported: u64,
}

impl PassReport {
    /// Create an empty report for a pass started at `started_at`
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            rows: Vec::new(),
            unchanged: 0,
            exported: 0,
            not_found: 0,
            failed: 0,
            deferred: 0,
            bytes_exported: 0,
        }
    }

    /// Add a row's diagnostics
    pub fn record(&mut self, row: RowReport) {
        match &row.outcome {
            RowOutcome::Unchanged { .. } => self.unchanged += 1,
            RowOutcome::Exported { start, end, .. } => {
                self.exported += 1;
                self.bytes_exported += end - start;
            }
            RowOutcome::NotFound => self.not_found += 1,
            RowOutcome::Failed { .. } => self.failed += 1,
            RowOutcome::Deferred => self.deferred += 1,
        }
        self.rows.push(row);
    }

    /// Number of rows seen
    pub fn checked(&self) -> usize {
        self.rows.len()
    }

    /// A pass succeeds when no row failed
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Diagnostics for one source
    pub fn row(&self, source_id: &str) -> Option<&RowReport> {
        self.rows.iter().find(|r| r.source_id == source_id)
    }

    /// Print summary
    pub fn print_summary(&self) {
        let elapsed = (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default();

        println!("=== Export Pass ===");
        println!("Started:    {}", self.started_at.to_rfc3339());
        println!("Duration:   {:.1?}", elapsed);
        println!("Checked:    {}", self.checked());
        println!("Exported:   {} ({})",
            self.exported,
            humansize::format_size(self.bytes_exported, humansize::BINARY)
        );
        println!("Unchanged:  {}", self.unchanged);
        println!("Not found:  {}", self.not_found);
        if self.deferred > 0 {
            println!("Deferred:   {}", self.deferred);
        }
        println!("Failed:     {}", self.failed);

        let failures: Vec<&RowReport> = self
            .rows
            .iter()
            .filter(|r| matches!(r.outcome, RowOutcome::Failed { .. }))
            .collect();
        if !failures.is_empty() {
            println!("\nFailures:");
            for row in failures {
                if let RowOutcome::Failed { stage, error, .. } = &row.outcome {
                    println!("  {} [{:?}] {}", row.source_id, stage, error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(source_id: &str, outcome: RowOutcome) -> RowReport {
        RowReport {
            source_id: source_id.to_string(),
            offset_before: 0,
            outcome,
            previous_attempt: None,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_counts_and_success() {
        let mut report = PassReport::new(Utc::now());
        report.record(row("a", RowOutcome::Unchanged { size: 0 }));
        report.record(row("b", RowOutcome::Exported { target_id: "t".into(), start: 10, end: 40 }));
        report.record(row("c", RowOutcome::NotFound));
        report.record(row("d", RowOutcome::Deferred));
        assert!(report.is_success());
        assert_eq!(report.bytes_exported, 30);
        assert_eq!(report.checked(), 4);

        report.record(row("e", RowOutcome::Failed { stage: Stage::Inspect, error: "x".into(), target_id: None }));
        assert!(!report.is_success());
        assert_eq!(report.row("c").map(|r| r.outcome.label()), Some("not_found"));
    }

    #[test]
    fn test_row_report_json_shape() {
        let json = serde_json::to_value(row(
            "mem://in/a",
            RowOutcome::Failed { stage: Stage::Commit, error: "down".into(), target_id: Some("mem://out/a_1".into()) },
        ))
        .unwrap();

        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["stage"], "commit");
        assert_eq!(json["target_id"], "mem://out/a_1");
        assert!(json.get("previous_attempt").is_none());
    }
}
