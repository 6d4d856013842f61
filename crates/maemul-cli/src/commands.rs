//! Subcommand implementations.

use crate::{MigrateArgs, StoreArgs, SweepArgs};
use anyhow::{Context, Result};
use maemul_core::{
    read_export, CancellationToken, FieldMapper, HygieneSweeper, LoaderConfig, MigrationPipeline,
    PipelineOptions, ResolverConfig, RestStore, RestStoreConfig, SweepConfig,
};
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn connect(args: &StoreArgs) -> Result<Arc<RestStore>> {
    let config = RestStoreConfig::new(&args.store_url, &args.store_key)
        .with_timeout(Duration::from_secs(args.timeout_secs))
        .with_requests_per_second(args.requests_per_second);
    let store = RestStore::new(config).context("Failed to set up store client")?;
    info!("Store: {}", args.store_url);
    Ok(Arc::new(store))
}

/// Cancel the token on Ctrl-C. In-flight batches finish; nothing new starts.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight batches");
            handle.cancel();
        }
    });
    token
}

pub fn map(input: &Path) -> Result<ExitCode> {
    let records = read_export(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let mut mapper = FieldMapper::new();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for record in mapper.map_all(&records) {
        serde_json::to_writer(&mut out, &record)?;
        writeln!(out)?;
    }

    let dropped = mapper.dropped_fields();
    if dropped.is_empty() {
        info!(rows = records.len(), "All columns mapped");
    } else {
        warn!(rows = records.len(), dropped = ?dropped, "Unmapped columns");
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn migrate(args: MigrateArgs) -> Result<ExitCode> {
    let records = read_export(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let store = connect(&args.store)?;

    let timeout = Duration::from_secs(args.store.timeout_secs);
    let options = PipelineOptions::new()
        .with_resolver(ResolverConfig::new(args.mode.into()).with_request_timeout(timeout))
        .with_loader(
            LoaderConfig::new()
                .with_batch_size(args.batch_size)
                .with_concurrency(args.concurrency)
                .with_request_timeout(timeout),
        )
        .with_dry_run(args.dry_run)
        .with_skip_loaded(args.skip_loaded);

    let cancel = cancel_on_ctrl_c();
    let report = MigrationPipeline::new(store, options).run(records, &cancel).await;

    match &args.report {
        Some(path) => {
            report
                .write_to(path)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", report.to_json_pretty()?),
    }

    if report.complete {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(
            fatal = report.fatal_error.as_deref().unwrap_or("cancelled"),
            "Migration incomplete"
        );
        Ok(ExitCode::from(2))
    }
}

pub async fn sweep(args: SweepArgs) -> Result<ExitCode> {
    let store = connect(&args.store)?;

    let mut config = SweepConfig::new().with_dry_run(args.dry_run);
    if !args.markers.is_empty() {
        config = config.with_markers(args.markers);
    }
    for sentinel in args.sentinel_managers {
        config = config.with_sentinel_manager(sentinel_value(&sentinel));
    }

    let report = HygieneSweeper::new(store, config).sweep().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if report.error.is_some() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

/// Manager ids are integers in some deployments and uuids in others.
fn sentinel_value(raw: &str) -> Value {
    raw.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(raw))
}
