//! In-process record store.
//!
//! Behaves like the hosted store for the operations the pipeline uses and can
//! be told to misbehave: reject batches containing a poisoned row, cap rows per
//! request, fail or throttle the next N inserts, or pretend a table is missing.

use super::{value_as_key, Filter, InsertMode, RecordStore, Row};
use crate::config::Tables;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Vec<Row>>,
    next_id: u64,
    /// (table, column, value): a batch containing such a row is rejected whole.
    poison: Vec<(String, String, Value)>,
    max_rows_per_request: Option<usize>,
    read_row_cap: Option<usize>,
    transient_insert_failures: usize,
    throttled_inserts: usize,
    missing_tables: HashSet<String>,
}

/// In-memory [`RecordStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    insert_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add rows to a table, assigning ids to rows without one.
    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        let mut state = self.state();
        for mut row in rows {
            state.assign_id(&mut row);
            state.tables.entry(table.to_string()).or_default().push(row);
        }
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state().tables.get(table).cloned().unwrap_or_default()
    }

    /// Reject any insert batch into `table` holding a row with `column == value`.
    pub fn reject_rows_where(&self, table: &str, column: &str, value: impl Into<Value>) {
        self.state()
            .poison
            .push((table.to_string(), column.to_string(), value.into()));
    }

    /// Reject insert requests with more rows than `limit`.
    pub fn set_max_rows_per_request(&self, limit: Option<usize>) {
        self.state().max_rows_per_request = limit;
    }

    /// Return at most `cap` rows per paginated read regardless of the requested limit.
    pub fn set_read_row_cap(&self, cap: Option<usize>) {
        self.state().read_row_cap = cap;
    }

    /// Fail the next `count` insert requests with a network error.
    pub fn fail_next_inserts(&self, count: usize) {
        self.state().transient_insert_failures = count;
    }

    /// Answer the next `count` insert requests with a rate-limit rejection.
    pub fn throttle_next_inserts(&self, count: usize) {
        self.state().throttled_inserts = count;
    }

    /// Make every operation on `table` fail as if it did not exist.
    pub fn remove_table(&self, table: &str) {
        let mut state = self.state();
        state.tables.remove(table);
        state.missing_tables.insert(table.to_string());
    }

    /// Number of insert requests received, successful or not.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

impl State {
    fn assign_id(&mut self, row: &mut Row) {
        self.next_id += 1;
        if !row.contains_key(Tables::ID_COLUMN) {
            row.insert(Tables::ID_COLUMN.to_string(), Value::from(self.next_id));
        }
    }

    fn check_table(&self, table: &str) -> Result<()> {
        if self.missing_tables.contains(table) {
            Err(MigrateError::TableNotFound {
                table: table.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn matching<'a>(&'a self, table: &str, filters: &'a [Filter]) -> impl Iterator<Item = &'a Row> {
        self.tables
            .get(table)
            .into_iter()
            .flatten()
            .filter(move |row| filters.iter().all(|f| row_matches(row, f)))
    }
}

fn row_matches(row: &Row, filter: &Filter) -> bool {
    let cell = row.get(filter.column()).filter(|v| !v.is_null());
    match filter {
        Filter::Eq(_, expected) => cell.is_some_and(|v| value_as_key(v) == value_as_key(expected)),
        Filter::Contains(_, needle) => cell
            .and_then(Value::as_str)
            .is_some_and(|s| s.to_lowercase().contains(&needle.to_lowercase())),
        Filter::IsNull(_) => cell.is_none(),
        Filter::In(_, set) => {
            cell.is_some_and(|v| set.iter().any(|s| value_as_key(s) == value_as_key(v)))
        }
        // SQL semantics: NULL NOT IN (...) is not true.
        Filter::NotIn(_, set) => {
            cell.is_some_and(|v| !set.iter().any(|s| value_as_key(s) == value_as_key(v)))
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_all(&self, table: &str) -> Result<Vec<Row>> {
        let state = self.state();
        state.check_table(table)?;
        Ok(state.tables.get(table).cloned().unwrap_or_default())
    }

    async fn insert_batch(&self, table: &str, rows: &[Row], mode: &InsertMode) -> Result<Vec<Row>> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        state.check_table(table)?;

        if state.transient_insert_failures > 0 {
            state.transient_insert_failures -= 1;
            return Err(MigrateError::Network {
                message: "connection reset by peer".to_string(),
                cause: None,
            });
        }

        if state.throttled_inserts > 0 {
            state.throttled_inserts -= 1;
            return Err(MigrateError::RateLimited {
                table: table.to_string(),
                retry_after_secs: None,
            });
        }

        if let Some(limit) = state.max_rows_per_request {
            if rows.len() > limit {
                return Err(MigrateError::PayloadTooLarge {
                    table: table.to_string(),
                    rows: rows.len(),
                    message: format!("at most {} rows per request", limit),
                });
            }
        }

        for (poison_table, column, value) in &state.poison {
            if poison_table != table {
                continue;
            }
            let filter = Filter::Eq(column.clone(), value.clone());
            if rows.iter().any(|row| row_matches(row, &filter)) {
                return Err(MigrateError::Store {
                    table: table.to_string(),
                    status: Some(400),
                    code: Some("23514".to_string()),
                    message: format!("new row violates check constraint on {}", column),
                });
            }
        }

        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            let mut row = row.clone();
            if let InsertMode::Upsert { on_conflict } = mode {
                if let Some(key) = row.get(on_conflict).filter(|v| !v.is_null()).cloned() {
                    let existing = state
                        .tables
                        .get_mut(table)
                        .and_then(|rows| rows.iter_mut().find(|r| r.get(on_conflict) == Some(&key)));
                    if let Some(existing) = existing {
                        for (k, v) in row {
                            existing.insert(k, v);
                        }
                        stored.push(existing.clone());
                        continue;
                    }
                }
            }
            state.assign_id(&mut row);
            state
                .tables
                .entry(table.to_string())
                .or_default()
                .push(row.clone());
            stored.push(row);
        }
        Ok(stored)
    }

    async fn delete_where(&self, table: &str, filters: &[Filter]) -> Result<usize> {
        if filters.is_empty() {
            return Err(MigrateError::Validation {
                field: "filters".to_string(),
                message: format!("refusing unfiltered delete on {}", table),
            });
        }
        let mut state = self.state();
        state.check_table(table)?;
        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !filters.iter().all(|f| row_matches(row, f)));
        Ok(before - rows.len())
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<usize> {
        let state = self.state();
        state.check_table(table)?;
        Ok(state.matching(table, filters).count())
    }

    async fn paginated_read(
        &self,
        table: &str,
        filters: &[Filter],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let state = self.state();
        state.check_table(table)?;
        let limit = state.read_row_cap.map_or(limit, |cap| cap.min(limit));
        Ok(state
            .matching(table, filters)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
