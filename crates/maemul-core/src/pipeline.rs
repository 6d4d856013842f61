//! Migration pipeline.
//!
//! Wires the stages together for one run:
//! map → resolve → pre-filter → count → load → count → spot check.
//!
//! `run` always returns a `MigrationReport`. Run-fatal conditions (reference
//! tables unreadable, store unreachable) end the run early with the report
//! marked incomplete; everything else is accounted for per row.

use crate::cancel::CancellationToken;
use crate::config::{LoaderDefaults, StoreConfig, Tables};
use crate::error::Result;
use crate::loader::{BatchLoader, LoaderConfig};
use crate::mapper::FieldMapper;
use crate::report::MigrationReport;
use crate::resolver::{LookupResolver, ResolverConfig};
use crate::store::{read_all_pages, timed, Filter, RecordStore};
use crate::types::{LegacyRecord, ReferenceId, ResolvedRecord};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Options for one run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub resolver: ResolverConfig,
    pub loader: LoaderConfig,
    /// Map and resolve but write nothing.
    pub dry_run: bool,
    /// Drop records whose source hash is already in the target table, and
    /// exact duplicates within the input.
    pub skip_loaded: bool,
    pub verify_sample: usize,
    pub page_size: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            resolver: ResolverConfig::default(),
            loader: LoaderConfig::default(),
            dry_run: false,
            skip_loaded: false,
            verify_sample: LoaderDefaults::VERIFY_SAMPLE_SIZE,
            page_size: StoreConfig::PAGE_SIZE,
        }
    }
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_skip_loaded(mut self, skip: bool) -> Self {
        self.skip_loaded = skip;
        self
    }

    pub fn with_verify_sample(mut self, sample: usize) -> Self {
        self.verify_sample = sample;
        self
    }
}

pub struct MigrationPipeline {
    store: Arc<dyn RecordStore>,
    options: PipelineOptions,
}

impl MigrationPipeline {
    pub fn new(store: Arc<dyn RecordStore>, options: PipelineOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run the whole migration over already-read legacy rows.
    pub async fn run(&self, records: Vec<LegacyRecord>, cancel: &CancellationToken) -> MigrationReport {
        let mut report = MigrationReport::new();
        report.dry_run = self.options.dry_run;
        report.rows_read = records.len();
        info!(run_id = %report.run_id, rows = records.len(), "Migration started");

        let mut mapper = FieldMapper::new();
        let normalized = mapper.map_all(&records);
        report.normalized = normalized.len();
        report.dropped_fields = mapper.dropped_fields().to_vec();
        report.record_parse_notes(&normalized);
        info!(
            normalized = normalized.len(),
            dropped_fields = report.dropped_fields.len(),
            "Mapping finished"
        );

        let resolver = match LookupResolver::load(self.store.clone(), self.options.resolver.clone()).await {
            Ok(resolver) => resolver,
            Err(e) => {
                error!(error = %e, "Reference tables unavailable, aborting run");
                report.mark_fatal(&e);
                report.finish();
                return report;
            }
        };
        let resolution = resolver.resolve_all(normalized).await;
        report.resolved = resolution.resolved.len();
        report.rejected_unresolved = resolution.rejected.len();
        report.unresolved_labels = resolution.unresolved;
        report.created_references = resolution.created;
        for failure in resolution.rejected {
            report.record_failure(failure);
        }

        let mut to_load = resolution.resolved;
        if self.options.skip_loaded {
            match self.drop_already_loaded(&mut to_load).await {
                Ok(skipped) => report.skipped_already_loaded = skipped,
                Err(e) => {
                    error!(error = %e, "Could not read loaded source hashes, refusing to load");
                    report.mark_fatal(&e);
                    report.finish();
                    return report;
                }
            }
        }

        let table = self.options.loader.table.clone();
        report.verification.count_before = self.count_rows(&table, &mut report.verification.warnings).await;

        if self.options.dry_run {
            info!(would_load = to_load.len(), "Dry run, nothing written");
            report.finish();
            return report;
        }

        let loader = BatchLoader::new(self.store.clone(), self.options.loader.clone());
        let outcome = loader.load(&to_load, cancel).await;

        let mut inserted_ids: Vec<ReferenceId> = Vec::new();
        for failure in outcome.failures {
            report.failed += 1;
            report.record_failure(failure);
        }
        report.warnings.extend(outcome.warnings);
        report.not_dispatched = outcome.not_dispatched;
        report.probed_row_limit = outcome.probed_row_limit;
        report.store_connectivity = Some(outcome.connectivity);
        for mut batch in outcome.batches {
            inserted_ids.append(&mut batch.inserted_ids);
            report.merge_batch(batch);
        }
        if let Some(fatal) = &outcome.fatal {
            error!(error = %fatal, "Run aborted");
            report.mark_fatal(fatal);
        }
        if outcome.cancelled {
            warn!(not_dispatched = report.not_dispatched, "Run cancelled by operator");
            report.mark_cancelled();
        }

        self.verify(&table, &inserted_ids, &mut report).await;

        report.finish();
        info!(run_id = %report.run_id, "{}", report.summary());
        report
    }

    /// Remove records already present in the store or repeated in the input.
    async fn drop_already_loaded(&self, records: &mut Vec<ResolvedRecord>) -> Result<usize> {
        let rows = read_all_pages(
            self.store.as_ref(),
            &self.options.loader.table,
            &[],
            self.options.page_size,
            self.options.loader.request_timeout,
        )
        .await?;
        let mut seen: HashSet<String> = rows
            .iter()
            .filter_map(|r| r.get(Tables::SOURCE_HASH_COLUMN))
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();

        let before = records.len();
        records.retain(|r| seen.insert(r.source_hash.clone()));
        let skipped = before - records.len();
        if skipped > 0 {
            info!(skipped, "Skipping records already loaded");
        }
        Ok(skipped)
    }

    async fn count_rows(&self, table: &str, warnings: &mut Vec<String>) -> Option<usize> {
        match timed(self.options.loader.request_timeout, self.store.count(table, &[])).await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(table, error = %e, "Row count unavailable");
                warnings.push(format!("count of {} failed: {}", table, e));
                None
            }
        }
    }

    /// Post-load checks. Problems become warnings, never failures.
    async fn verify(&self, table: &str, inserted_ids: &[ReferenceId], report: &mut MigrationReport) {
        let warnings = &mut report.verification.warnings;
        report.verification.count_after = self.count_rows(table, warnings).await;

        if let Some(false) = report.verification.delta_matches(report.inserted) {
            let message = format!(
                "table grew by {:?} rows but {} were inserted",
                report
                    .verification
                    .count_after
                    .zip(report.verification.count_before)
                    .map(|(after, before)| after as i64 - before as i64),
                report.inserted
            );
            warn!("{}", message);
            report.verification.warnings.push(message);
        }

        let sample: Vec<Value> = inserted_ids
            .iter()
            .take(self.options.verify_sample)
            .map(|id| id.0.clone())
            .collect();
        if sample.is_empty() {
            return;
        }
        let filters = [Filter::is_in(Tables::ID_COLUMN, sample.clone())];
        let read = timed(
            self.options.loader.request_timeout,
            self.store.paginated_read(table, &filters, 0, sample.len()),
        )
        .await;
        match read {
            Ok(rows) => {
                report.verification.sampled_ids = rows
                    .iter()
                    .filter_map(|r| r.get(Tables::ID_COLUMN).cloned())
                    .map(ReferenceId)
                    .collect();
                if rows.len() != sample.len() {
                    let message = format!(
                        "spot check read back {} of {} inserted rows",
                        rows.len(),
                        sample.len()
                    );
                    warn!("{}", message);
                    report.verification.warnings.push(message);
                }
            }
            Err(e) => {
                warn!(error = %e, "Spot check failed");
                report.verification.warnings.push(format!("spot check failed: {}", e));
            }
        }
    }
}
