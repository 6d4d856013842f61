//! Batch Loader.
//!
//! Writes resolved records to the store in bounded batches:
//! - transient errors retry with exponential backoff per sub-batch
//! - non-transient and size-limit rejections bisect down to single rows
//! - a size-limit rejection lowers the row limit for every later request
//! - independent batches run with bounded concurrency
//! - cancellation and the connectivity breaker stop dispatch at batch boundaries
//!
//! Each sub-batch runs an explicit state machine, see [`BatchState`].

use crate::cancel::CancellationToken;
use crate::config::{LoaderDefaults, StoreConfig, Tables};
use crate::error::MigrateError;
use crate::mapper::CanonicalField;
use crate::network::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, RetryConfig};
use crate::report::{DataWarning, RowFailure};
use crate::store::{timed, InsertMode, RecordStore, Row};
use crate::types::{ReferenceId, ResolvedRecord};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Columns holding currency amounts in won.
const CURRENCY_FIELDS: [CanonicalField; 3] = [
    CanonicalField::Price,
    CanonicalField::LeasePrice,
    CanonicalField::MonthlyFee,
];

/// Batch Loader settings.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub table: String,
    pub batch_size: usize,
    /// In-flight batches, clamped to `1..=LoaderDefaults::MAX_CONCURRENCY`.
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
    /// Currency values above this are clamped before submission.
    pub max_currency_value: i64,
    pub insert_mode: InsertMode,
    pub circuit: CircuitBreakerConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            table: Tables::PROPERTIES.to_string(),
            batch_size: LoaderDefaults::BATCH_SIZE,
            concurrency: LoaderDefaults::CONCURRENCY,
            retry: RetryConfig::default(),
            request_timeout: StoreConfig::REQUEST_TIMEOUT,
            max_currency_value: LoaderDefaults::MAX_CURRENCY_VALUE,
            insert_mode: InsertMode::Insert,
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

impl LoaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_currency_value(mut self, max: i64) -> Self {
        self.max_currency_value = max;
        self
    }

    pub fn with_insert_mode(mut self, mode: InsertMode) -> Self {
        self.insert_mode = mode;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.circuit.failure_threshold = threshold.max(1);
        self
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, LoaderDefaults::MAX_CONCURRENCY)
    }
}

/// Outcome of one top-level batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_index: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Per-row failures; carried into the report's failure list.
    #[serde(skip)]
    pub errors: Vec<RowFailure>,
    /// Store requests spent, including retries and bisection halves.
    pub requests: usize,
    pub retries: usize,
    #[serde(skip)]
    pub inserted_ids: Vec<ReferenceId>,
}

/// Everything the loader produced for one run.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub batches: Vec<BatchResult>,
    /// Rows that could not be turned into a store payload.
    pub failures: Vec<RowFailure>,
    pub warnings: Vec<DataWarning>,
    pub not_dispatched: usize,
    pub probed_row_limit: Option<usize>,
    pub cancelled: bool,
    /// Run-fatal condition that stopped dispatch.
    pub fatal: Option<MigrateError>,
    /// Breaker counters at the end of the load.
    pub connectivity: CircuitBreakerStats,
}

impl LoadOutcome {
    pub fn inserted(&self) -> usize {
        self.batches.iter().map(|b| b.succeeded).sum()
    }

    pub fn failed(&self) -> usize {
        self.batches.iter().map(|b| b.failed).sum::<usize>() + self.failures.len()
    }
}

/// A record serialized for the store.
#[derive(Debug, Clone)]
pub struct PreparedRow {
    pub source_row: usize,
    pub label: String,
    pub row: Row,
}

/// Serialize records into store rows, rounding and clamping currency fields.
pub fn prepare_rows(
    records: &[ResolvedRecord],
    max_currency_value: i64,
) -> (Vec<PreparedRow>, Vec<DataWarning>, Vec<RowFailure>) {
    let mut prepared = Vec::with_capacity(records.len());
    let mut warnings = Vec::new();
    let mut failures = Vec::new();

    for record in records {
        let mut row = match serde_json::to_value(record) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                failures.push(RowFailure::from_error(
                    record.source_row,
                    record.display_label(),
                    &MigrateError::Other(format!("record serialized to {}", other)),
                ));
                continue;
            }
            Err(e) => {
                failures.push(RowFailure::from_error(
                    record.source_row,
                    record.display_label(),
                    &e.into(),
                ));
                continue;
            }
        };
        row.remove("source_row");

        for field in CURRENCY_FIELDS {
            let column = field.column();
            let Some(amount) = row.get(column).and_then(Value::as_f64) else {
                continue;
            };
            let rounded = amount.round();
            let value = if rounded > max_currency_value as f64 {
                warn!(
                    row = record.source_row,
                    field = column,
                    value = amount,
                    max = max_currency_value,
                    "Currency value clamped"
                );
                warnings.push(DataWarning {
                    source_row: record.source_row,
                    field: column.to_string(),
                    message: format!("{} clamped to {}", amount, max_currency_value),
                });
                max_currency_value
            } else {
                rounded as i64
            };
            row.insert(column.to_string(), Value::from(value));
        }

        prepared.push(PreparedRow {
            source_row: record.source_row,
            label: record.display_label(),
            row,
        });
    }

    (prepared, warnings, failures)
}

/// Lifecycle of one submitted sub-batch.
///
/// `Pending → InFlight → Succeeded | RetryScheduled | Bisecting | Failed`.
/// `RetryScheduled` returns to `InFlight` until the retry budget is spent,
/// then the sub-batch fails. `Bisecting` hands both halves back to the
/// batch's work stack.
#[derive(Debug)]
enum BatchState {
    Pending,
    InFlight { attempt: u32 },
    RetryScheduled { attempt: u32, delay: Duration },
    Bisecting { cause: MigrateError },
    Succeeded { ids: Vec<ReferenceId> },
    Failed { cause: MigrateError },
}

/// Terminal states of [`BatchState`].
enum SubmitOutcome {
    Succeeded(Vec<ReferenceId>),
    Bisect,
    Failed(MigrateError),
}

enum Dispatch {
    Ran(BatchResult),
    Skipped { batch_index: usize, rows: usize },
}

/// Writes resolved records to one store table.
pub struct BatchLoader {
    store: Arc<dyn RecordStore>,
    config: LoaderConfig,
    breaker: CircuitBreaker,
    /// Largest request size not yet known to be rejected for size.
    row_limit: AtomicUsize,
}

impl BatchLoader {
    pub fn new(store: Arc<dyn RecordStore>, config: LoaderConfig) -> Self {
        let breaker = CircuitBreaker::with_config(config.table.clone(), config.circuit.clone());
        Self {
            store,
            row_limit: AtomicUsize::new(config.batch_size.max(1)),
            config,
            breaker,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn row_limit(&self) -> usize {
        self.row_limit.load(Ordering::SeqCst).max(1)
    }

    fn lower_row_limit(&self, rejected_rows: usize) {
        let limit = (rejected_rows / 2).max(1);
        let previous = self.row_limit.fetch_min(limit, Ordering::SeqCst);
        if limit < previous {
            warn!(
                table = %self.config.table,
                rejected_rows,
                new_limit = limit,
                "Store rejected request size, lowering row limit"
            );
        }
    }

    /// Load every record. Never fails as a whole; see [`LoadOutcome`].
    pub async fn load(&self, records: &[ResolvedRecord], cancel: &CancellationToken) -> LoadOutcome {
        let (prepared, warnings, failures) = prepare_rows(records, self.config.max_currency_value);
        let mut outcome = LoadOutcome {
            warnings,
            failures,
            ..Default::default()
        };

        let batch_size = self.config.batch_size.max(1);
        let concurrency = self.config.effective_concurrency();
        info!(
            table = %self.config.table,
            rows = prepared.len(),
            batch_size,
            concurrency,
            "Loading records"
        );

        let dispatched: Vec<Dispatch> = stream::iter(prepared.chunks(batch_size).enumerate())
            .map(|(batch_index, rows)| async move {
                if cancel.is_cancelled() || self.breaker.is_open() {
                    return Dispatch::Skipped {
                        batch_index,
                        rows: rows.len(),
                    };
                }
                Dispatch::Ran(self.run_batch(batch_index, rows).await)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for dispatch in dispatched {
            match dispatch {
                Dispatch::Ran(result) => outcome.batches.push(result),
                Dispatch::Skipped { batch_index, rows } => {
                    debug!(batch = batch_index, rows, "Batch not dispatched");
                    outcome.not_dispatched += rows;
                }
            }
        }
        outcome.batches.sort_by_key(|b| b.batch_index);

        let limit = self.row_limit();
        if limit < batch_size {
            outcome.probed_row_limit = Some(limit);
        }
        if self.breaker.is_open() {
            outcome.fatal = Some(MigrateError::ConnectivityLost {
                consecutive_failures: self.breaker.consecutive_failures(),
            });
        } else if cancel.is_cancelled() && outcome.not_dispatched > 0 {
            outcome.cancelled = true;
        }
        outcome.connectivity = self.breaker.stats();

        info!(
            table = %self.config.table,
            inserted = outcome.inserted(),
            failed = outcome.failed(),
            not_dispatched = outcome.not_dispatched,
            "Load finished"
        );
        outcome
    }

    /// Process one top-level batch through a work stack of row ranges.
    async fn run_batch(&self, batch_index: usize, rows: &[PreparedRow]) -> BatchResult {
        let mut result = BatchResult {
            batch_index,
            attempted: rows.len(),
            ..Default::default()
        };
        let mut work: Vec<Range<usize>> = vec![0..rows.len()];

        while let Some(range) = work.pop() {
            let limit = self.row_limit();
            if range.len() > limit {
                // Pre-split to a size the store has not rejected, without spending a request.
                let mut parts = Vec::new();
                let mut start = range.start;
                while start < range.end {
                    let end = (start + limit).min(range.end);
                    parts.push(start..end);
                    start = end;
                }
                work.extend(parts.into_iter().rev());
                continue;
            }

            let slice = &rows[range.clone()];
            match self.submit(batch_index, slice, &mut result).await {
                SubmitOutcome::Succeeded(ids) => {
                    result.succeeded += slice.len();
                    result.inserted_ids.extend(ids);
                }
                SubmitOutcome::Bisect => {
                    let mid = range.start + range.len() / 2;
                    work.push(mid..range.end);
                    work.push(range.start..mid);
                }
                SubmitOutcome::Failed(cause) => {
                    fail_rows(&mut result, slice, &cause);
                    if matches!(cause, MigrateError::ConnectivityLost { .. }) {
                        for rest in work.drain(..) {
                            fail_rows(&mut result, &rows[rest], &cause);
                        }
                    }
                }
            }
        }

        debug!(
            batch = batch_index,
            succeeded = result.succeeded,
            failed = result.failed,
            requests = result.requests,
            "Batch finished"
        );
        result
    }

    /// Drive one sub-batch to a terminal state.
    async fn submit(&self, batch_index: usize, rows: &[PreparedRow], result: &mut BatchResult) -> SubmitOutcome {
        let payload: Vec<Row> = rows.iter().map(|r| r.row.clone()).collect();
        let table = self.config.table.as_str();
        let mut state = BatchState::Pending;

        loop {
            state = match state {
                BatchState::Pending => BatchState::InFlight { attempt: 0 },

                BatchState::InFlight { attempt } => {
                    if self.breaker.is_open() {
                        BatchState::Failed {
                            cause: MigrateError::ConnectivityLost {
                                consecutive_failures: self.breaker.consecutive_failures(),
                            },
                        }
                    } else {
                        result.requests += 1;
                        let response = timed(
                            self.config.request_timeout,
                            self.store.insert_batch(table, &payload, &self.config.insert_mode),
                        )
                        .await;
                        self.on_response(batch_index, rows.len(), attempt, response)
                    }
                }

                BatchState::RetryScheduled { attempt, delay } => {
                    result.retries += 1;
                    tokio::time::sleep(delay).await;
                    BatchState::InFlight { attempt }
                }

                BatchState::Bisecting { cause } => {
                    debug!(
                        batch = batch_index,
                        rows = rows.len(),
                        error = %cause,
                        "Bisecting rejected sub-batch"
                    );
                    return SubmitOutcome::Bisect;
                }

                BatchState::Succeeded { ids } => return SubmitOutcome::Succeeded(ids),

                BatchState::Failed { cause } => return SubmitOutcome::Failed(cause),
            };
        }
    }

    /// Transition out of `InFlight`.
    fn on_response(
        &self,
        batch_index: usize,
        rows: usize,
        attempt: u32,
        response: crate::Result<Vec<Row>>,
    ) -> BatchState {
        let err = match response {
            Ok(inserted) => {
                self.breaker.record_success();
                let ids = inserted
                    .iter()
                    .filter_map(|r| r.get(Tables::ID_COLUMN))
                    .filter(|v| !v.is_null())
                    .cloned()
                    .map(ReferenceId)
                    .collect();
                return BatchState::Succeeded { ids };
            }
            Err(err) => err,
        };

        if err.is_transient() {
            if err.is_connectivity_failure() {
                self.breaker.record_failure();
                if self.breaker.is_open() {
                    return BatchState::Failed {
                        cause: MigrateError::ConnectivityLost {
                            consecutive_failures: self.breaker.consecutive_failures(),
                        },
                    };
                }
            } else {
                // Throttled or 5xx: the store answered, the retry budget decides.
                self.breaker.record_success();
            }
            if !self.config.retry.has_attempts_left(attempt) {
                warn!(batch = batch_index, rows, error = %err, "Retry budget exhausted");
                return BatchState::Failed { cause: err };
            }
            let delay = self.config.retry.delay_after(attempt, &err);
            debug!(
                batch = batch_index,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            return BatchState::RetryScheduled {
                attempt: attempt + 1,
                delay,
            };
        }

        // The store answered, so connectivity is fine.
        self.breaker.record_success();
        if err.is_size_limit() {
            self.lower_row_limit(rows);
        }
        if rows > 1 {
            BatchState::Bisecting { cause: err }
        } else {
            BatchState::Failed { cause: err }
        }
    }
}

fn fail_rows(result: &mut BatchResult, rows: &[PreparedRow], cause: &MigrateError) {
    for row in rows {
        warn!(row = row.source_row, label = %row.label, error = %cause, "Row failed");
        result.errors.push(RowFailure::from_error(row.source_row, &row.label, cause));
    }
    result.failed += rows.len();
}
