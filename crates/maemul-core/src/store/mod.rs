//! Record store boundary.
//!
//! The pipeline only needs a handful of operations from the hosted database:
//! unfiltered reads of small reference tables, batched inserts, filtered
//! deletes, counts and paginated reads. `RecordStore` captures exactly that.
//!
//! Implementations:
//! - [`RestStore`]: PostgREST-compatible HTTP API
//! - [`MemoryStore`]: in-process store with fault injection

mod memory;
mod rest;

pub use memory::MemoryStore;
pub use rest::{RestStore, RestStoreConfig};

use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// One row as exchanged with the store.
pub type Row = serde_json::Map<String, Value>;

/// Row filter. Multiple filters combine with AND.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    /// Case-insensitive substring match on a text column.
    Contains(String, String),
    IsNull(String),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(column.into(), value.into())
    }

    pub fn contains(column: impl Into<String>, needle: impl Into<String>) -> Self {
        Filter::Contains(column.into(), needle.into())
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Filter::IsNull(column.into())
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In(column.into(), values)
    }

    pub fn not_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::NotIn(column.into(), values)
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _)
            | Filter::Contains(c, _)
            | Filter::IsNull(c)
            | Filter::In(c, _)
            | Filter::NotIn(c, _) => c,
        }
    }
}

/// Insert semantics for [`RecordStore::insert_batch`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InsertMode {
    #[default]
    Insert,
    /// Merge into existing rows that collide on the given column(s).
    Upsert { on_conflict: String },
}

/// Minimal surface of the hosted record store used by the pipeline.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Unfiltered read of a small table.
    async fn fetch_all(&self, table: &str) -> Result<Vec<Row>>;

    /// Insert or upsert rows in one request; returns the stored rows.
    ///
    /// A failure applies to the whole request. Errors must classify through
    /// [`MigrateError::is_transient`] and [`MigrateError::is_size_limit`].
    async fn insert_batch(&self, table: &str, rows: &[Row], mode: &InsertMode) -> Result<Vec<Row>>;

    /// Delete matching rows; returns how many were removed.
    /// Implementations refuse an empty filter list.
    async fn delete_where(&self, table: &str, filters: &[Filter]) -> Result<usize>;

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<usize>;

    /// Read up to `limit` matching rows starting at `offset`, ordered by `id`.
    /// The store may return fewer rows than asked even when more exist.
    async fn paginated_read(
        &self,
        table: &str,
        filters: &[Filter],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Row>>;
}

/// Bound a store call by `timeout`; elapsing counts as a transient error.
pub async fn timed<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(MigrateError::Timeout(timeout)),
    }
}

/// Read every matching row, page by page.
///
/// Advances by the number of rows actually returned and stops only on an
/// empty page, so a server-side row ceiling lower than `page_size` cannot
/// silently truncate the result.
pub async fn read_all_pages(
    store: &dyn RecordStore,
    table: &str,
    filters: &[Filter],
    page_size: usize,
    timeout: Duration,
) -> Result<Vec<Row>> {
    let page_size = page_size.max(1);
    let mut rows = Vec::new();
    loop {
        let page = timed(
            timeout,
            store.paginated_read(table, filters, rows.len(), page_size),
        )
        .await?;
        if page.is_empty() {
            break;
        }
        debug!(table, offset = rows.len(), returned = page.len(), "Read page");
        rows.extend(page);
    }
    Ok(rows)
}

/// Render a scalar JSON value the way filters compare it.
pub(crate) fn value_as_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
