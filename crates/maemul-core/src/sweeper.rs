//! Hygiene Sweeper.
//!
//! Finds synthetic listings (test fixtures, demo rows) by name marker or by
//! a reserved sentinel manager, then deletes them children-first. The
//! dependent tables are a fixed ordered list, not inferred from the schema.
//!
//! Sweeping is advisory: a failing step is logged and skipped, never fatal.
//! Name matching is a heuristic, so `dry_run` exists to review candidates
//! before anything is deleted.

use crate::config::{StoreConfig, Tables};
use crate::error::Result;
use crate::network::{retry_transient, RetryConfig};
use crate::store::{read_all_pages, timed, Filter, RecordStore};
use crate::types::ReferenceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Name fragments that mark a listing as synthetic.
pub const DEFAULT_MARKERS: [&str; 6] = ["테스트", "test", "dummy", "더미", "sample", "샘플"];

/// Sweeper settings.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub table: String,
    pub markers: Vec<String>,
    /// Manager ids reserved for system-generated rows.
    pub sentinel_manager_ids: Vec<Value>,
    /// Tables referencing `table` through `property_id`, deleted in this order.
    pub dependents: Vec<String>,
    pub dry_run: bool,
    pub page_size: usize,
    pub delete_chunk: usize,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            table: Tables::PROPERTIES.to_string(),
            markers: DEFAULT_MARKERS.iter().map(|m| m.to_string()).collect(),
            sentinel_manager_ids: Vec::new(),
            dependents: vec![
                Tables::PROPERTY_COMMENTS.to_string(),
                Tables::PROPERTY_STATUS_HISTORY.to_string(),
                Tables::ACTIVITY_LOGS.to_string(),
            ],
            dry_run: false,
            page_size: StoreConfig::PAGE_SIZE,
            delete_chunk: StoreConfig::DELETE_CHUNK,
            request_timeout: StoreConfig::REQUEST_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}

impl SweepConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the default markers.
    pub fn with_markers(mut self, markers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.markers = markers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sentinel_manager(mut self, id: impl Into<Value>) -> Self {
        self.sentinel_manager_ids.push(id.into());
        self
    }

    pub fn with_dependents(mut self, tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependents = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_delete_chunk(mut self, chunk: usize) -> Self {
        self.delete_chunk = chunk.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// A row classified as synthetic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepCandidate {
    pub id: ReferenceId,
    pub name: Option<String>,
    /// The marker or sentinel that matched.
    pub matched: String,
}

/// One deletion step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepStep {
    pub table: String,
    pub deleted: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub candidates: Vec<SweepCandidate>,
    pub steps: Vec<SweepStep>,
    pub deleted_total: usize,
    /// Set when candidates could not be identified at all.
    pub error: Option<String>,
}

pub struct HygieneSweeper {
    store: Arc<dyn RecordStore>,
    config: SweepConfig,
}

impl HygieneSweeper {
    pub fn new(store: Arc<dyn RecordStore>, config: SweepConfig) -> Self {
        Self { store, config }
    }

    /// Rows matching any marker or sentinel, each once.
    pub async fn find_candidates(&self) -> Result<Vec<SweepCandidate>> {
        let mut probes: Vec<(Filter, String)> = self
            .config
            .markers
            .iter()
            .filter(|m| !m.trim().is_empty())
            .map(|m| (Filter::contains(Tables::NAME_COLUMN, m.trim()), m.clone()))
            .collect();
        for sentinel in &self.config.sentinel_manager_ids {
            probes.push((
                Filter::Eq(Tables::MANAGER_COLUMN.to_string(), sentinel.clone()),
                format!("manager {}", sentinel),
            ));
        }

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for (filter, matched) in probes {
            let rows = read_all_pages(
                self.store.as_ref(),
                &self.config.table,
                std::slice::from_ref(&filter),
                self.config.page_size,
                self.config.request_timeout,
            )
            .await?;
            for row in rows {
                let Some(id) = row.get(Tables::ID_COLUMN).filter(|v| !v.is_null()) else {
                    continue;
                };
                let id = ReferenceId(id.clone());
                if !seen.insert(id.to_string()) {
                    continue;
                }
                candidates.push(SweepCandidate {
                    id,
                    name: row
                        .get(Tables::NAME_COLUMN)
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    matched: matched.clone(),
                });
            }
        }
        Ok(candidates)
    }

    /// Identify and delete synthetic rows, dependents first.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport {
            dry_run: self.config.dry_run,
            ..Default::default()
        };

        report.candidates = match self.find_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Could not identify synthetic rows, sweep skipped");
                report.error = Some(e.to_string());
                return report;
            }
        };

        info!(
            candidates = report.candidates.len(),
            dry_run = self.config.dry_run,
            "Synthetic rows identified"
        );
        if self.config.dry_run || report.candidates.is_empty() {
            return report;
        }

        let ids: Vec<Value> = report.candidates.iter().map(|c| c.id.0.clone()).collect();
        for table in &self.config.dependents {
            let step = self.delete_ids(table, Tables::PROPERTY_FK, &ids).await;
            report.steps.push(step);
        }
        let step = self.delete_ids(&self.config.table, Tables::ID_COLUMN, &ids).await;
        report.steps.push(step);

        report.deleted_total = report.steps.iter().map(|s| s.deleted).sum();
        info!(deleted = report.deleted_total, "Sweep finished");
        report
    }

    /// Delete rows whose `column` is in `ids`, chunk by chunk. Stops the
    /// step at the first error.
    async fn delete_ids(&self, table: &str, column: &str, ids: &[Value]) -> SweepStep {
        let mut step = SweepStep {
            table: table.to_string(),
            deleted: 0,
            error: None,
        };
        let timeout = self.config.request_timeout;
        let what = format!("delete from {}", table);

        for chunk in ids.chunks(self.config.delete_chunk.max(1)) {
            let filters = [Filter::is_in(column, chunk.to_vec())];
            let result = retry_transient(&self.config.retry, &what, || {
                timed(timeout, self.store.delete_where(table, &filters))
            })
            .await;
            match result {
                Ok(count) => step.deleted += count,
                Err(e) => {
                    warn!(table, error = %e, "Sweep step failed, skipping table");
                    step.error = Some(e.to_string());
                    break;
                }
            }
        }

        info!(table, deleted = step.deleted, "Sweep step");
        step
    }
}
