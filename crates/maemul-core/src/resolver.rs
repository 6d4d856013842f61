//! Lookup Resolver.
//!
//! Replaces categorical labels (property type, status, transaction type,
//! manager) with reference ids taken from small lookup tables in the store.
//!
//! The resolver is an explicit context object built once per run by
//! [`LookupResolver::load`]. Tables are read-only after loading except in
//! auto-create mode, where inserts are serialized behind a single writer lock.

use crate::config::{StoreConfig, Tables};
use crate::error::{FailureKind, MigrateError, Result};
use crate::network::{retry_transient, RetryConfig};
use crate::report::{CreatedReference, RowFailure, UnresolvedLabel};
use crate::store::{timed, InsertMode, RecordStore, Row};
use crate::types::{NormalizedRecord, ReferenceId, ResolvedRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One lookup category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceCategory {
    PropertyType,
    Status,
    TransactionType,
    Manager,
}

impl ReferenceCategory {
    pub const ALL: [ReferenceCategory; 4] = [
        ReferenceCategory::PropertyType,
        ReferenceCategory::Status,
        ReferenceCategory::TransactionType,
        ReferenceCategory::Manager,
    ];

    pub fn table(self) -> &'static str {
        match self {
            ReferenceCategory::PropertyType => Tables::PROPERTY_TYPES,
            ReferenceCategory::Status => Tables::PROPERTY_STATUSES,
            ReferenceCategory::TransactionType => Tables::TRANSACTION_TYPES,
            ReferenceCategory::Manager => Tables::USERS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceCategory::PropertyType => "property_type",
            ReferenceCategory::Status => "status",
            ReferenceCategory::TransactionType => "transaction_type",
            ReferenceCategory::Manager => "manager",
        }
    }

    /// Managers are people; they are never invented from a spreadsheet cell.
    pub fn allows_auto_create(self) -> bool {
        !matches!(self, ReferenceCategory::Manager)
    }

    fn label_of(self, record: &NormalizedRecord) -> Option<&str> {
        match self {
            ReferenceCategory::PropertyType => record.property_type_label.as_deref(),
            ReferenceCategory::Status => record.status_label.as_deref(),
            ReferenceCategory::TransactionType => record.transaction_type_label.as_deref(),
            ReferenceCategory::Manager => record.manager_label.as_deref(),
        }
    }
}

impl std::fmt::Display for ReferenceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lookup key: trimmed, inner whitespace collapsed, lowercased.
pub fn normalize_key(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Normalized label → id map for one category.
#[derive(Debug, Clone)]
pub struct ReferenceTable {
    category: ReferenceCategory,
    entries: HashMap<String, ReferenceId>,
}

impl ReferenceTable {
    pub fn new(category: ReferenceCategory) -> Self {
        Self {
            category,
            entries: HashMap::new(),
        }
    }

    /// Build from store rows.
    ///
    /// Category rows are keyed by `name`. Manager rows are keyed by `name`,
    /// full `email` and the email's local part.
    pub fn from_rows(category: ReferenceCategory, rows: &[Row]) -> Self {
        let mut table = Self::new(category);
        for row in rows {
            let Some(id) = row.get(Tables::ID_COLUMN).filter(|v| !v.is_null()) else {
                debug!(category = %category, "Reference row without id skipped");
                continue;
            };
            let id = ReferenceId(id.clone());
            for key in row_keys(category, row) {
                table.insert(&key, id.clone());
            }
        }
        table
    }

    /// Add a key. At most one id per normalized label: the first one wins.
    pub fn insert(&mut self, label: &str, id: ReferenceId) -> bool {
        let key = normalize_key(label);
        if key.is_empty() {
            return false;
        }
        match self.entries.get(&key) {
            Some(existing) if *existing != id => {
                warn!(
                    category = %self.category,
                    label = %key,
                    kept = %existing,
                    ignored = %id,
                    "Reference label maps to several ids, keeping the first"
                );
                false
            }
            Some(_) => false,
            None => {
                self.entries.insert(key, id);
                true
            }
        }
    }

    pub fn get(&self, label: &str) -> Option<&ReferenceId> {
        self.entries.get(&normalize_key(label))
    }

    pub fn category(&self) -> ReferenceCategory {
        self.category
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn row_keys(category: ReferenceCategory, row: &Row) -> Vec<String> {
    let text = |column: &str| row.get(column).and_then(Value::as_str).map(str::to_string);
    let mut keys: Vec<String> = text(Tables::NAME_COLUMN).into_iter().collect();
    if category == ReferenceCategory::Manager {
        if let Some(email) = text(Tables::EMAIL_COLUMN) {
            if let Some((local, _)) = email.split_once('@') {
                keys.push(local.to_string());
            }
            keys.push(email);
        }
    }
    keys
}

/// What to do with a label that is not in its reference table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionMode {
    /// Exclude the record from loading.
    Strict,
    /// Load the record with a null foreign key.
    #[default]
    Lenient,
    /// Create the missing category row (never a manager), then retry once.
    AutoCreate,
}

impl std::str::FromStr for ResolutionMode {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(ResolutionMode::Strict),
            "lenient" => Ok(ResolutionMode::Lenient),
            "auto-create" | "auto_create" | "autocreate" => Ok(ResolutionMode::AutoCreate),
            other => Err(MigrateError::Config {
                message: format!("unknown resolution mode: {}", other),
            }),
        }
    }
}

/// Resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub mode: ResolutionMode,
    /// Re-fetch a category's table once per run on the first miss.
    pub refresh_on_miss: bool,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mode: ResolutionMode::default(),
            refresh_on_miss: true,
            retry: RetryConfig::default(),
            request_timeout: StoreConfig::REQUEST_TIMEOUT,
        }
    }
}

impl ResolverConfig {
    pub fn new(mode: ResolutionMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_refresh_on_miss(mut self, refresh: bool) -> Self {
        self.refresh_on_miss = refresh;
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
}

/// Outcome of resolving a set of records.
#[derive(Debug, Default)]
pub struct Resolution {
    pub resolved: Vec<ResolvedRecord>,
    /// Records excluded in strict mode.
    pub rejected: Vec<RowFailure>,
    pub unresolved: Vec<UnresolvedLabel>,
    pub created: Vec<CreatedReference>,
}

/// Resolves categorical labels against reference tables.
pub struct LookupResolver {
    store: Arc<dyn RecordStore>,
    config: ResolverConfig,
    tables: RwLock<HashMap<ReferenceCategory, ReferenceTable>>,
    memo: Mutex<HashMap<(ReferenceCategory, String), Option<ReferenceId>>>,
    refreshed: Mutex<HashSet<ReferenceCategory>>,
    created: Mutex<Vec<CreatedReference>>,
    /// Single writer for auto-create.
    create_lock: tokio::sync::Mutex<()>,
}

impl LookupResolver {
    /// Fetch every reference table.
    ///
    /// Transient failures are retried; a table that still cannot be read is
    /// fatal for the run.
    pub async fn load(store: Arc<dyn RecordStore>, config: ResolverConfig) -> Result<Self> {
        let mut tables = HashMap::new();
        for category in ReferenceCategory::ALL {
            let rows = fetch_reference_rows(store.as_ref(), &config, category).await?;
            let table = ReferenceTable::from_rows(category, &rows);
            info!(
                category = %category,
                rows = rows.len(),
                keys = table.len(),
                "Loaded reference table"
            );
            tables.insert(category, table);
        }
        Ok(Self::from_tables(store, config, tables))
    }

    /// Resolver over pre-built tables.
    pub fn from_tables(
        store: Arc<dyn RecordStore>,
        config: ResolverConfig,
        tables: HashMap<ReferenceCategory, ReferenceTable>,
    ) -> Self {
        Self {
            store,
            config,
            tables: RwLock::new(tables),
            memo: Mutex::new(HashMap::new()),
            refreshed: Mutex::new(HashSet::new()),
            created: Mutex::new(Vec::new()),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn mode(&self) -> ResolutionMode {
        self.config.mode
    }

    /// Snapshot of one category's table.
    pub fn table(&self, category: ReferenceCategory) -> Option<ReferenceTable> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .cloned()
    }

    fn lookup(&self, category: ReferenceCategory, label: &str) -> Option<ReferenceId> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .and_then(|t| t.get(label))
            .cloned()
    }

    fn remember(&self, category: ReferenceCategory, key: String, id: Option<ReferenceId>) {
        self.memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((category, key), id);
    }

    /// Resolve one label. `None` means unresolved after every fallback the
    /// mode allows. Misses are never errors.
    pub async fn resolve_label(&self, category: ReferenceCategory, label: &str) -> Option<ReferenceId> {
        let key = normalize_key(label);
        if key.is_empty() {
            return None;
        }
        let cached = self
            .memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(category, key.clone()))
            .cloned();
        if let Some(cached) = cached {
            return cached;
        }

        let mut found = self.lookup(category, &key);

        if found.is_none() && self.config.refresh_on_miss && self.refresh(category).await {
            found = self.lookup(category, &key);
        }

        if found.is_none()
            && self.config.mode == ResolutionMode::AutoCreate
            && category.allows_auto_create()
        {
            found = self.auto_create(category, label).await;
        }

        if found.is_none() {
            debug!(category = %category, label, "Label did not resolve");
        }
        self.remember(category, key, found.clone());
        found
    }

    /// Re-read a category's table once per run. Returns whether a refresh happened.
    async fn refresh(&self, category: ReferenceCategory) -> bool {
        let first = self
            .refreshed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(category);
        if !first {
            return false;
        }

        match fetch_reference_rows(self.store.as_ref(), &self.config, category).await {
            Ok(rows) => {
                let table = ReferenceTable::from_rows(category, &rows);
                debug!(category = %category, keys = table.len(), "Refreshed reference table");
                self.tables
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(category, table);
                true
            }
            Err(e) => {
                warn!(category = %category, error = %e, "Reference refresh failed, keeping cached table");
                false
            }
        }
    }

    async fn auto_create(&self, category: ReferenceCategory, label: &str) -> Option<ReferenceId> {
        let _guard = self.create_lock.lock().await;

        // Another task may have created it while we waited.
        if let Some(id) = self.lookup(category, label) {
            return Some(id);
        }

        let name = label.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut row = Row::new();
        row.insert(Tables::NAME_COLUMN.to_string(), Value::String(name.clone()));
        let rows = [row];
        let mode = InsertMode::Insert;

        let table = category.table();
        let timeout = self.config.request_timeout;
        let what = format!("create {} row", category);
        let result = retry_transient(&self.config.retry, &what, || {
            timed(timeout, self.store.insert_batch(table, &rows, &mode))
        })
        .await;

        let id = match result {
            Ok(inserted) => inserted
                .first()
                .and_then(|r| r.get(Tables::ID_COLUMN))
                .filter(|v| !v.is_null())
                .cloned()
                .map(ReferenceId),
            Err(e) => {
                warn!(category = %category, label = %name, error = %e, "Auto-create failed");
                return None;
            }
        };
        let Some(id) = id else {
            warn!(category = %category, label = %name, "Auto-created row came back without id");
            return None;
        };

        info!(category = %category, label = %name, id = %id, "Created reference row");
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(category)
            .or_insert_with(|| ReferenceTable::new(category))
            .insert(&name, id.clone());
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CreatedReference {
                category,
                label: name,
                id: id.clone(),
            });

        // Retry the lookup once against the updated table.
        self.lookup(category, label)
    }

    /// Resolve every record according to the configured mode.
    pub async fn resolve_all(&self, records: Vec<NormalizedRecord>) -> Resolution {
        let mut resolution = Resolution::default();
        let mut misses: BTreeMap<(ReferenceCategory, String), (String, usize)> = BTreeMap::new();

        for record in records {
            let mut ids: [Option<ReferenceId>; 4] = Default::default();
            let mut missed = Vec::new();

            for (slot, category) in ids.iter_mut().zip(ReferenceCategory::ALL) {
                let Some(label) = category.label_of(&record) else {
                    continue;
                };
                if normalize_key(label).is_empty() {
                    continue;
                }
                *slot = self.resolve_label(category, label).await;
                if slot.is_none() {
                    misses
                        .entry((category, normalize_key(label)))
                        .or_insert_with(|| (label.trim().to_string(), 0))
                        .1 += 1;
                    missed.push(format!("{} '{}'", category, label.trim()));
                }
            }

            if !missed.is_empty() && self.config.mode == ResolutionMode::Strict {
                resolution.rejected.push(RowFailure::new(
                    record.source_row,
                    record.display_label(),
                    FailureKind::Unresolved,
                    format!("unresolved {}", missed.join(", ")),
                ));
                continue;
            }

            let [property_type_id, status_id, transaction_type_id, manager_id] = ids;
            resolution.resolved.push(ResolvedRecord {
                source_row: record.source_row,
                source_hash: record.source_hash,
                listing: record.listing,
                property_type_id,
                status_id,
                transaction_type_id,
                manager_id,
            });
        }

        resolution.unresolved = misses
            .into_iter()
            .map(|((category, _), (label, records))| UnresolvedLabel {
                category,
                label,
                records,
            })
            .collect();
        resolution.created = std::mem::take(
            &mut *self.created.lock().unwrap_or_else(PoisonError::into_inner),
        );

        if !resolution.unresolved.is_empty() {
            warn!(
                labels = resolution.unresolved.len(),
                rejected = resolution.rejected.len(),
                mode = ?self.config.mode,
                "Unresolved reference labels"
            );
        }
        resolution
    }
}

async fn fetch_reference_rows(
    store: &dyn RecordStore,
    config: &ResolverConfig,
    category: ReferenceCategory,
) -> Result<Vec<Row>> {
    let table = category.table();
    let timeout = config.request_timeout;
    let what = format!("fetch {}", table);
    retry_transient(&config.retry, &what, || timed(timeout, store.fetch_all(table)))
        .await
        .map_err(|e| MigrateError::ReferenceFetch {
            table: table.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.seed(
            Tables::PROPERTY_TYPES,
            vec![
                row(json!({"id": 1, "name": "아파트"})),
                row(json!({"id": 2, "name": "오피스텔"})),
            ],
        );
        store.seed(
            Tables::PROPERTY_STATUSES,
            vec![row(json!({"id": 10, "name": "거래가능"}))],
        );
        store.seed(
            Tables::TRANSACTION_TYPES,
            vec![row(json!({"id": 20, "name": "매매"})), row(json!({"id": 21, "name": "전세"}))],
        );
        store.seed(
            Tables::USERS,
            vec![row(json!({"id": "u-1", "name": "김민수", "email": "minsu.kim@agency.kr"}))],
        );
        store
    }

    fn fast_config(mode: ResolutionMode) -> ResolverConfig {
        ResolverConfig::new(mode).with_retry(RetryConfig::new().with_max_attempts(1))
    }

    fn record(row: usize, property_type: Option<&str>, manager: Option<&str>) -> NormalizedRecord {
        NormalizedRecord {
            source_row: row,
            property_type_label: property_type.map(str::to_string),
            manager_label: manager.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("  Officetel  Tower "), "officetel tower");
        assert_eq!(normalize_key("아파트"), "아파트");
        assert_eq!(normalize_key("   "), "");
    }

    #[test]
    fn test_reference_table_first_id_wins() {
        let rows = vec![
            row(json!({"id": 1, "name": "아파트"})),
            row(json!({"id": 9, "name": " 아파트 "})),
            row(json!({"name": "no id"})),
        ];
        let table = ReferenceTable::from_rows(ReferenceCategory::PropertyType, &rows);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("아파트"), Some(&ReferenceId(json!(1))));
    }

    #[test]
    fn test_manager_keys() {
        let rows = vec![row(json!({"id": 3, "name": "Lee Jiwon", "email": "JIWON@agency.kr"}))];
        let table = ReferenceTable::from_rows(ReferenceCategory::Manager, &rows);
        for label in ["lee jiwon", "LEE  JIWON", "jiwon", "jiwon@agency.kr"] {
            assert_eq!(table.get(label), Some(&ReferenceId(json!(3))), "{}", label);
        }
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("strict".parse::<ResolutionMode>().unwrap(), ResolutionMode::Strict);
        assert_eq!("auto-create".parse::<ResolutionMode>().unwrap(), ResolutionMode::AutoCreate);
        assert!("loose".parse::<ResolutionMode>().is_err());
    }

    #[tokio::test]
    async fn test_case_and_whitespace_variants_resolve() {
        let store = seeded_store();
        let resolver = LookupResolver::load(store, fast_config(ResolutionMode::Strict))
            .await
            .unwrap();

        let id = resolver
            .resolve_label(ReferenceCategory::Manager, "  Minsu.Kim ")
            .await;
        assert_eq!(id, Some(ReferenceId(json!("u-1"))));
        let id = resolver
            .resolve_label(ReferenceCategory::TransactionType, "전세")
            .await;
        assert_eq!(id, Some(ReferenceId(json!(21))));
    }

    #[tokio::test]
    async fn test_lenient_miss_nulls_and_reports() {
        let store = seeded_store();
        let resolver = LookupResolver::load(store, fast_config(ResolutionMode::Lenient))
            .await
            .unwrap();

        let resolution = resolver
            .resolve_all(vec![
                record(1, Some("아파트"), Some("김민수")),
                record(2, Some("상가주택"), None),
                record(3, Some("상가 주택"), None),
            ])
            .await;

        assert_eq!(resolution.resolved.len(), 3);
        assert!(resolution.rejected.is_empty());
        assert_eq!(resolution.resolved[0].property_type_id, Some(ReferenceId(json!(1))));
        assert_eq!(resolution.resolved[1].property_type_id, None);
        assert_eq!(resolution.unresolved.len(), 2);
        assert!(resolution.unresolved.iter().all(|u| u.records == 1));
    }

    #[tokio::test]
    async fn test_strict_miss_excludes_record() {
        let store = seeded_store();
        let resolver = LookupResolver::load(store, fast_config(ResolutionMode::Strict))
            .await
            .unwrap();

        let resolution = resolver
            .resolve_all(vec![
                record(1, Some("아파트"), None),
                record(2, Some("빌딩"), None),
                record(3, Some("빌딩"), Some("nobody")),
            ])
            .await;

        assert_eq!(resolution.resolved.len(), 1);
        assert_eq!(resolution.rejected.len(), 2);
        assert_eq!(resolution.rejected[0].kind, FailureKind::Unresolved);
        let building = resolution
            .unresolved
            .iter()
            .find(|u| u.label == "빌딩")
            .unwrap();
        assert_eq!(building.records, 2);
    }

    #[tokio::test]
    async fn test_auto_create_once_per_label() {
        let store = seeded_store();
        let resolver = LookupResolver::load(store.clone(), fast_config(ResolutionMode::AutoCreate))
            .await
            .unwrap();

        let resolution = resolver
            .resolve_all(vec![
                record(1, Some("지식산업센터"), Some("unknown manager")),
                record(2, Some("지식산업센터"), None),
            ])
            .await;

        assert_eq!(store.rows(Tables::PROPERTY_TYPES).len(), 3);
        assert_eq!(resolution.created.len(), 1);
        let id = resolution.resolved[0].property_type_id.clone();
        assert!(id.is_some());
        assert_eq!(resolution.resolved[1].property_type_id, id);

        // Managers are never created.
        assert_eq!(store.rows(Tables::USERS).len(), 1);
        assert_eq!(resolution.resolved[0].manager_id, None);
        assert_eq!(resolution.unresolved.len(), 1);
        assert_eq!(resolution.unresolved[0].category, ReferenceCategory::Manager);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_concurrent_change() {
        let store = seeded_store();
        let resolver = LookupResolver::load(store.clone(), fast_config(ResolutionMode::Strict))
            .await
            .unwrap();

        store.seed(Tables::PROPERTY_TYPES, vec![row(json!({"id": 5, "name": "상가"}))]);
        let id = resolver
            .resolve_label(ReferenceCategory::PropertyType, "상가")
            .await;
        assert_eq!(id, Some(ReferenceId(json!(5))));
    }

    #[tokio::test]
    async fn test_refresh_disabled_keeps_snapshot() {
        let store = seeded_store();
        let config = fast_config(ResolutionMode::Lenient).with_refresh_on_miss(false);
        let resolver = LookupResolver::load(store.clone(), config).await.unwrap();

        store.seed(Tables::PROPERTY_TYPES, vec![row(json!({"id": 5, "name": "상가"}))]);
        let id = resolver
            .resolve_label(ReferenceCategory::PropertyType, "상가")
            .await;
        assert_eq!(id, None);
    }

    #[tokio::test]
    async fn test_reference_fetch_failure_is_fatal() {
        let store = seeded_store();
        store.remove_table(Tables::PROPERTY_STATUSES);
        let err = LookupResolver::load(store, fast_config(ResolutionMode::Lenient))
            .await
            .err()
            .unwrap();
        assert!(err.is_run_fatal());
        assert!(matches!(err, MigrateError::ReferenceFetch { .. }));
    }
}
