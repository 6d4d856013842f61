//! Centralized configuration defaults for the migration pipeline.
//!
//! Runtime configuration structs (`LoaderConfig`, `ResolverConfig`, ...) live
//! next to the components that use them and take their defaults from here.

use std::time::Duration;

/// Record store access defaults.
pub struct StoreConfig;

impl StoreConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const REQUESTS_PER_SECOND: u32 = 10;
    /// Rows requested per page on paginated reads. The store may silently return fewer.
    pub const PAGE_SIZE: usize = 1000;
    /// Ids per `in.(...)` filter when deleting by id list.
    pub const DELETE_CHUNK: usize = 100;
    pub const REST_PATH: &'static str = "rest/v1";
    pub const USER_AGENT: &'static str = "maemul/0.1";
}

/// Batch Loader defaults.
pub struct LoaderDefaults;

impl LoaderDefaults {
    /// Chosen below the store's undocumented per-request row ceiling.
    pub const BATCH_SIZE: usize = 50;
    pub const CONCURRENCY: usize = 2;
    pub const MAX_CONCURRENCY: usize = 4;
    pub const RETRY_ATTEMPTS: u32 = 4;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
    /// Largest integer a JSON number carries without precision loss (2^53 - 1).
    pub const MAX_CURRENCY_VALUE: i64 = 9_007_199_254_740_991;
    /// Consecutive transient failures across batches before the run is declared offline.
    pub const CONNECTIVITY_FAILURE_THRESHOLD: u32 = 8;
    /// Rows read back after a load for spot checks.
    pub const VERIFY_SAMPLE_SIZE: usize = 5;
}

/// Default table and column names in the target store.
pub struct Tables;

impl Tables {
    pub const PROPERTIES: &'static str = "properties";
    pub const PROPERTY_TYPES: &'static str = "property_types";
    pub const PROPERTY_STATUSES: &'static str = "property_statuses";
    pub const TRANSACTION_TYPES: &'static str = "transaction_types";
    pub const USERS: &'static str = "users";

    pub const PROPERTY_COMMENTS: &'static str = "property_comments";
    pub const PROPERTY_STATUS_HISTORY: &'static str = "property_status_history";
    pub const ACTIVITY_LOGS: &'static str = "activity_logs";

    pub const ID_COLUMN: &'static str = "id";
    pub const NAME_COLUMN: &'static str = "name";
    pub const EMAIL_COLUMN: &'static str = "email";
    pub const MANAGER_COLUMN: &'static str = "manager_id";
    pub const PROPERTY_FK: &'static str = "property_id";
    pub const SOURCE_HASH_COLUMN: &'static str = "source_hash";
}
