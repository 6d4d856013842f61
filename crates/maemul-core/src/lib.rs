//! Maemul Core - migration pipeline for legacy Korean listing spreadsheets.
//!
//! Reads hand-maintained exports, normalizes them into typed listing
//! records, resolves categorical labels against reference tables and bulk
//! loads the result into a PostgREST-style record store, isolating bad rows
//! instead of failing the run. A separate sweeper removes synthetic rows.
//!
//! # Example
//!
//! ```rust,ignore
//! use maemul_core::{read_export, CancellationToken, MigrationPipeline, PipelineOptions};
//! use maemul_core::store::{RestStore, RestStoreConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> maemul_core::Result<()> {
//!     let store = RestStore::new(RestStoreConfig::new("https://example.supabase.co", "key"))?;
//!     let records = read_export("listings.csv".as_ref())?;
//!
//!     let pipeline = MigrationPipeline::new(Arc::new(store), PipelineOptions::default());
//!     let report = pipeline.run(records, &CancellationToken::new()).await;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod loader;
pub mod mapper;
pub mod network;
pub mod parsers;
pub mod pipeline;
pub mod reader;
pub mod report;
pub mod resolver;
pub mod store;
pub mod sweeper;
pub mod types;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use error::{FailureKind, MigrateError, Result};
pub use loader::{BatchLoader, BatchResult, LoadOutcome, LoaderConfig};
pub use mapper::{FieldMapper, MappingTarget, LEGACY_FIELD_TABLE};
pub use parsers::{parse_dual_area_value, parse_korean_currency, DualArea};
pub use pipeline::{MigrationPipeline, PipelineOptions};
pub use reader::read_export;
pub use report::{MigrationReport, RowFailure, UnparsedValue, UnresolvedLabel};
pub use resolver::{
    LookupResolver, ReferenceCategory, ReferenceTable, Resolution, ResolutionMode, ResolverConfig,
};
pub use store::{Filter, InsertMode, MemoryStore, RecordStore, RestStore, RestStoreConfig, Row};
pub use sweeper::{HygieneSweeper, SweepConfig, SweepReport};
pub use types::{LegacyRecord, LegacyValue, NormalizedRecord, ReferenceId, ResolvedRecord};
