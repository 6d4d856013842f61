//! Migration report.
//!
//! One `MigrationReport` is produced per run, whatever happens. It is the
//! operator's record of what was read, what resolved, what landed in the
//! store and what needs manual remediation.

use crate::error::{FailureKind, MigrateError};
use crate::loader::BatchResult;
use crate::network::CircuitBreakerStats;
use crate::resolver::ReferenceCategory;
use crate::types::{NormalizedRecord, ParseNoteKind, ReferenceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// A record that did not make it into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFailure {
    pub source_row: usize,
    pub label: String,
    pub kind: FailureKind,
    pub reason: String,
}

impl RowFailure {
    pub fn new(source_row: usize, label: impl Into<String>, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            source_row,
            label: label.into(),
            kind,
            reason: reason.into(),
        }
    }

    /// Failure attributed to a store error.
    pub fn from_error(source_row: usize, label: impl Into<String>, err: &MigrateError) -> Self {
        Self::new(source_row, label, err.failure_kind(), err.to_string())
    }
}

/// A categorical label that did not resolve, with the number of records carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedLabel {
    pub category: ReferenceCategory,
    pub label: String,
    pub records: usize,
}

/// A reference row created by auto-create mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedReference {
    pub category: ReferenceCategory,
    pub label: String,
    pub id: ReferenceId,
}

/// Aggregated parse notes per legacy column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteCount {
    pub label: String,
    pub kind: ParseNoteKind,
    pub count: usize,
    /// First raw value seen, as an example for the operator.
    pub example: String,
}

/// A value that could not be parsed, kept for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnparsedValue {
    pub source_row: usize,
    pub label: String,
    pub raw: String,
}

/// Data-quality event that did not fail the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataWarning {
    pub source_row: usize,
    pub field: String,
    pub message: String,
}

/// Post-load consistency checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub count_before: Option<usize>,
    pub count_after: Option<usize>,
    /// Ids of rows read back as a spot check.
    pub sampled_ids: Vec<ReferenceId>,
    pub warnings: Vec<String>,
}

impl Verification {
    /// Whether the table grew by exactly `inserted` rows.
    pub fn delta_matches(&self, inserted: usize) -> Option<bool> {
        match (self.count_before, self.count_after) {
            (Some(before), Some(after)) => Some(after.saturating_sub(before) == inserted),
            _ => None,
        }
    }
}

/// Machine-readable outcome of one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub dry_run: bool,

    /// False when a run-fatal condition stopped the run early.
    pub complete: bool,
    pub cancelled: bool,
    pub fatal_error: Option<String>,

    pub rows_read: usize,
    pub normalized: usize,
    pub resolved: usize,
    pub rejected_unresolved: usize,
    pub skipped_already_loaded: usize,
    pub unresolved_labels: Vec<UnresolvedLabel>,
    pub created_references: Vec<CreatedReference>,
    pub dropped_fields: Vec<String>,
    pub parse_notes: Vec<NoteCount>,
    /// Every unparsed value with its row; the matching fields are null.
    pub unparsed_values: Vec<UnparsedValue>,

    pub inserted: usize,
    pub failed: usize,
    /// Rows in batches never dispatched because the run was cancelled or aborted.
    pub not_dispatched: usize,
    pub failures: Vec<RowFailure>,
    pub failure_breakdown: BTreeMap<FailureKind, usize>,
    pub warnings: Vec<DataWarning>,
    pub batches: Vec<BatchResult>,
    /// Largest batch size the store accepted after a size-limit rejection.
    pub probed_row_limit: Option<usize>,
    /// Connectivity breaker counters; absent when nothing was loaded.
    pub store_connectivity: Option<CircuitBreakerStats>,

    pub verification: Verification,
}

impl Default for MigrationReport {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            dry_run: false,
            complete: true,
            cancelled: false,
            fatal_error: None,
            rows_read: 0,
            normalized: 0,
            resolved: 0,
            rejected_unresolved: 0,
            skipped_already_loaded: 0,
            unresolved_labels: Vec::new(),
            created_references: Vec::new(),
            dropped_fields: Vec::new(),
            parse_notes: Vec::new(),
            unparsed_values: Vec::new(),
            inserted: 0,
            failed: 0,
            not_dispatched: 0,
            failures: Vec::new(),
            failure_breakdown: BTreeMap::new(),
            warnings: Vec::new(),
            batches: Vec::new(),
            probed_row_limit: None,
            store_connectivity: None,
            verification: Verification::default(),
        }
    }

    /// Count parse notes by (column, kind) and list unparsed values by row.
    pub fn record_parse_notes(&mut self, records: &[NormalizedRecord]) {
        let mut counts: BTreeMap<(String, ParseNoteKind), (usize, String)> = BTreeMap::new();
        self.unparsed_values.clear();
        for record in records {
            for note in &record.notes {
                counts
                    .entry((note.label.clone(), note.kind))
                    .or_insert_with(|| (0, note.raw.clone()))
                    .0 += 1;
                if note.kind == ParseNoteKind::Unparsed {
                    self.unparsed_values.push(UnparsedValue {
                        source_row: record.source_row,
                        label: note.label.clone(),
                        raw: note.raw.clone(),
                    });
                }
            }
        }
        self.parse_notes = counts
            .into_iter()
            .map(|((label, kind), (count, example))| NoteCount {
                label,
                kind,
                count,
                example,
            })
            .collect();
    }

    pub fn record_failure(&mut self, failure: RowFailure) {
        *self.failure_breakdown.entry(failure.kind).or_insert(0) += 1;
        self.failures.push(failure);
    }

    /// Fold one batch outcome into the totals.
    pub fn merge_batch(&mut self, batch: BatchResult) {
        self.inserted += batch.succeeded;
        self.failed += batch.failed;
        for failure in batch.errors.iter().cloned() {
            self.record_failure(failure);
        }
        self.batches.push(batch);
    }

    /// Mark the run as stopped by a run-fatal condition.
    pub fn mark_fatal(&mut self, err: &MigrateError) {
        self.complete = false;
        self.fatal_error = Some(err.to_string());
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
        self.complete = false;
    }

    /// Stamp the finish time and sort batches by index.
    pub fn finish(&mut self) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
        self.batches.sort_by_key(|b| b.batch_index);
        self.failures.sort_by_key(|f| f.source_row);
    }

    pub fn to_json_pretty(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report as pretty JSON.
    pub fn write_to(&self, path: &Path) -> crate::Result<()> {
        let json = self.to_json_pretty()?;
        std::fs::write(path, json).map_err(|e| MigrateError::io_with_path(e, path))
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "read={} normalized={} resolved={} inserted={} failed={} not_dispatched={} unresolved_labels={} dropped_fields={}{}",
            self.rows_read,
            self.normalized,
            self.resolved,
            self.inserted,
            self.failed,
            self.not_dispatched,
            self.unresolved_labels.len(),
            self.dropped_fields.len(),
            if self.complete { "" } else { " INCOMPLETE" }
        )
    }
}
