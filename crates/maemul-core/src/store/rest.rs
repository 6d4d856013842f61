//! PostgREST-compatible record store over HTTP.
//!
//! Wraps reqwest with:
//! - `apikey` + bearer authentication
//! - client-side rate limiting (governor)
//! - filter encoding (`eq.`, `ilike.`, `is.null`, `in.()`, `not.in.()`)
//! - status and error-body classification into `MigrateError`

use super::{value_as_key, Filter, InsertMode, RecordStore, Row};
use crate::config::StoreConfig;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Connection settings for [`RestStore`].
#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub requests_per_second: u32,
}

impl RestStoreConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: StoreConfig::REQUEST_TIMEOUT,
            requests_per_second: StoreConfig::REQUESTS_PER_SECOND,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_requests_per_second(mut self, rps: u32) -> Self {
        self.requests_per_second = rps;
        self
    }
}

/// Error body returned by PostgREST.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
}

/// HTTP record store.
pub struct RestStore {
    client: Client,
    rest_root: Url,
    api_key: String,
    timeout: Duration,
    limiter: DefaultDirectRateLimiter,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> Result<Self> {
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let rest_root = Url::parse(&base)
            .and_then(|u| u.join(&format!("{}/", StoreConfig::REST_PATH)))
            .map_err(|e| MigrateError::Config {
                message: format!("Invalid store URL {}: {}", config.base_url, e),
            })?;

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(StoreConfig::USER_AGENT)
            .build()
            .map_err(|e| MigrateError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            client,
            rest_root,
            api_key: config.api_key,
            timeout: config.timeout,
            limiter: RateLimiter::direct(Quota::per_second(rps)),
        })
    }

    fn table_url(&self, table: &str) -> Result<Url> {
        self.rest_root.join(table).map_err(|e| MigrateError::Config {
            message: format!("Invalid table name {}: {}", table, e),
        })
    }

    async fn request(&self, method: Method, table: &str) -> Result<RequestBuilder> {
        self.limiter.until_ready().await;
        let url = self.table_url(table)?;
        Ok(self
            .client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key))
    }

    async fn send(&self, table: &str, rows: usize, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                MigrateError::Timeout(self.timeout)
            } else {
                MigrateError::Network {
                    message: format!("Request to {} failed: {}", table, e),
                    cause: std::error::Error::source(&e).map(|s| s.to_string()),
                }
            }
        })?;
        check_response(table, rows, response).await
    }
}

/// Turn a non-success response into a classified error.
async fn check_response(table: &str, rows: usize, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        return Err(MigrateError::RateLimited {
            table: table.to_string(),
            retry_after_secs: retry_after,
        });
    }

    let text = response.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
    let message = match (body.message, body.details) {
        (Some(m), Some(d)) => format!("{} ({})", m, d),
        (Some(m), None) => m,
        _ => text,
    };
    Err(classify_failure(table, rows, status.as_u16(), body.code, message))
}

/// Decode a 2xx body as rows.
///
/// The request has already taken effect, so a body that cannot be read or
/// parsed is reported as a store error rather than a transient one.
async fn read_rows(table: &str, response: Response) -> Result<Vec<Row>> {
    let status = response.status().as_u16();
    let malformed = |message: String| MigrateError::Store {
        table: table.to_string(),
        status: Some(status),
        code: None,
        message,
    };
    let text = response
        .text()
        .await
        .map_err(|e| malformed(format!("unreadable response body: {}", e)))?;
    serde_json::from_str(&text).map_err(|e| malformed(format!("malformed response body: {}", e)))
}

/// Map an HTTP status and PostgREST error code to a pipeline error.
pub(crate) fn classify_failure(
    table: &str,
    rows: usize,
    status: u16,
    code: Option<String>,
    message: String,
) -> MigrateError {
    let code_is = |c: &str| code.as_deref() == Some(c);

    if status == 413 || message.to_lowercase().contains("too large") {
        return MigrateError::PayloadTooLarge {
            table: table.to_string(),
            rows,
            message,
        };
    }
    if code_is("42P01") || code_is("PGRST205") || (status == 404 && code.is_none()) {
        return MigrateError::TableNotFound {
            table: table.to_string(),
        };
    }
    MigrateError::Store {
        table: table.to_string(),
        status: Some(status),
        code,
        message,
    }
}

/// Quote a value for use inside a PostgREST `in.(...)` list.
fn quote_list_item(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| matches!(c, ',' | '(' | ')' | '.' | ':' | '"' | '\\') || c.is_whitespace());
    if needs_quotes {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{}\"", escaped)
    } else {
        value.to_string()
    }
}

/// Encode one filter as a query-string pair.
fn encode_filter(filter: &Filter) -> (String, String) {
    let list = |values: &[serde_json::Value]| {
        values
            .iter()
            .map(|v| quote_list_item(&value_as_key(v)))
            .collect::<Vec<_>>()
            .join(",")
    };
    let value = match filter {
        Filter::Eq(_, v) => format!("eq.{}", value_as_key(v)),
        Filter::Contains(_, needle) => format!("ilike.*{}*", needle),
        Filter::IsNull(_) => "is.null".to_string(),
        Filter::In(_, values) => format!("in.({})", list(values)),
        Filter::NotIn(_, values) => format!("not.in.({})", list(values)),
    };
    (filter.column().to_string(), value)
}

fn encode_filters(filters: &[Filter]) -> Vec<(String, String)> {
    filters.iter().map(encode_filter).collect()
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
fn parse_content_range(value: &str) -> Option<usize> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl RecordStore for RestStore {
    async fn fetch_all(&self, table: &str) -> Result<Vec<Row>> {
        let builder = self
            .request(Method::GET, table)
            .await?
            .query(&[("select", "*")]);
        let response = self.send(table, 0, builder).await?;
        read_rows(table, response).await
    }

    async fn insert_batch(&self, table: &str, rows: &[Row], mode: &InsertMode) -> Result<Vec<Row>> {
        let mut builder = self.request(Method::POST, table).await?.json(rows);
        builder = match mode {
            InsertMode::Insert => builder.header("Prefer", "return=representation"),
            InsertMode::Upsert { on_conflict } => builder
                .query(&[("on_conflict", on_conflict.as_str())])
                .header("Prefer", "return=representation,resolution=merge-duplicates"),
        };
        debug!(table, rows = rows.len(), "POST batch");
        let response = self.send(table, rows.len(), builder).await?;
        // Committed: resending would duplicate the rows, so only the ids are lost.
        match read_rows(table, response).await {
            Ok(inserted) => Ok(inserted),
            Err(e) => {
                warn!(table, rows = rows.len(), error = %e, "Insert accepted without readable rows");
                Ok(Vec::new())
            }
        }
    }

    async fn delete_where(&self, table: &str, filters: &[Filter]) -> Result<usize> {
        if filters.is_empty() {
            return Err(MigrateError::Validation {
                field: "filters".to_string(),
                message: format!("refusing unfiltered delete on {}", table),
            });
        }
        let builder = self
            .request(Method::DELETE, table)
            .await?
            .query(&[("select", "id")])
            .query(&encode_filters(filters))
            .header("Prefer", "return=representation");
        let response = self.send(table, 0, builder).await?;
        Ok(read_rows(table, response).await?.len())
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<usize> {
        let builder = self
            .request(Method::HEAD, table)
            .await?
            .query(&[("select", "id")])
            .query(&encode_filters(filters))
            .header("Prefer", "count=exact");
        let response = self.send(table, 0, builder).await?;
        let range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        parse_content_range(&range).ok_or_else(|| {
            warn!(table, content_range = %range, "Count response without a total");
            MigrateError::Store {
                table: table.to_string(),
                status: None,
                code: None,
                message: format!("unparseable Content-Range: {:?}", range),
            }
        })
    }

    async fn paginated_read(
        &self,
        table: &str,
        filters: &[Filter],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let builder = self
            .request(Method::GET, table)
            .await?
            .query(&[("select", "*"), ("order", "id.asc")])
            .query(&[("offset", offset), ("limit", limit)])
            .query(&encode_filters(filters));
        let response = self.send(table, 0, builder).await?;
        read_rows(table, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::loader::{BatchLoader, LoaderConfig};
    use crate::network::RetryConfig;
    use crate::types::{ListingFields, ResolvedRecord};
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::Arc;

    fn store_for(server: &mockito::ServerGuard) -> RestStore {
        RestStore::new(RestStoreConfig::new(server.url(), "secret").with_requests_per_second(100))
            .unwrap()
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_encode_filters() {
        assert_eq!(
            encode_filter(&Filter::eq("manager_id", 7)),
            ("manager_id".to_string(), "eq.7".to_string())
        );
        assert_eq!(
            encode_filter(&Filter::contains("name", "테스트")).1,
            "ilike.*테스트*"
        );
        assert_eq!(encode_filter(&Filter::is_null("status_id")).1, "is.null");
        assert_eq!(
            encode_filter(&Filter::is_in("id", vec![json!(1), json!(2)])).1,
            "in.(1,2)"
        );
        assert_eq!(
            encode_filter(&Filter::not_in("name", vec![json!("a,b"), json!("c")])).1,
            "not.in.(\"a,b\",c)"
        );
    }

    #[test]
    fn test_quote_list_item() {
        assert_eq!(quote_list_item("abc"), "abc");
        assert_eq!(quote_list_item("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_list_item(""), "\"\"");
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("0-24/*"), None);
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure("properties", 50, 413, None, "Payload".into());
        assert!(err.is_size_limit());

        let err = classify_failure("properties", 1, 409, Some("23505".into()), "dup".into());
        assert!(!err.is_transient());
        assert!(matches!(err, MigrateError::Store { status: Some(409), .. }));

        let err = classify_failure("properties", 1, 502, None, "bad gateway".into());
        assert!(err.is_transient());

        let err = classify_failure("nope", 0, 404, Some("PGRST205".into()), "missing".into());
        assert!(matches!(err, MigrateError::TableNotFound { .. }));
    }

    #[test]
    fn test_invalid_base_url() {
        let result = RestStore::new(RestStoreConfig::new("not a url", "k"));
        assert!(matches!(result, Err(MigrateError::Config { .. })));
    }

    #[tokio::test]
    async fn test_fetch_all_sends_credentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/v1/property_types")
            .match_query(Matcher::UrlEncoded("select".into(), "*".into()))
            .match_header("apikey", "secret")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":1,"name":"아파트"},{"id":2,"name":"오피스텔"}]"#)
            .create_async()
            .await;

        let rows = store_for(&server).fetch_all("property_types").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], json!("아파트"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_insert_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/rest/v1/properties")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let err = store_for(&server)
            .insert_batch("properties", &[row(json!({"name": "a"}))], &InsertMode::Insert)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_insert_constraint_violation_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/rest/v1/properties")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":"22003","message":"numeric field overflow","details":null}"#)
            .create_async()
            .await;

        let err = store_for(&server)
            .insert_batch("properties", &[row(json!({"price": 1e30}))], &InsertMode::Insert)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(!err.is_size_limit());
        match err {
            MigrateError::Store { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("22003"));
                assert_eq!(message, "numeric field overflow");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upsert_sets_conflict_target() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/rest/v1/properties")
            .match_query(Matcher::UrlEncoded("on_conflict".into(), "source_hash".into()))
            .match_header(
                "prefer",
                "return=representation,resolution=merge-duplicates",
            )
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":10,"source_hash":"h"}]"#)
            .create_async()
            .await;

        let mode = InsertMode::Upsert {
            on_conflict: "source_hash".into(),
        };
        let rows = store_for(&server)
            .insert_batch("properties", &[row(json!({"source_hash": "h"}))], &mode)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_count_reads_content_range() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("HEAD", "/rest/v1/properties")
            .match_query(Matcher::UrlEncoded("name".into(), "ilike.*dummy*".into()))
            .match_header("prefer", "count=exact")
            .with_status(200)
            .with_header("content-range", "0-0/42")
            .create_async()
            .await;

        let count = store_for(&server)
            .count("properties", &[Filter::contains("name", "dummy")])
            .await
            .unwrap();
        assert_eq!(count, 42);
    }

    #[tokio::test]
    async fn test_delete_counts_returned_rows() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("DELETE", "/rest/v1/property_comments")
            .match_query(Matcher::UrlEncoded("property_id".into(), "in.(1,2)".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":5},{"id":6},{"id":7}]"#)
            .create_async()
            .await;

        let deleted = store_for(&server)
            .delete_where(
                "property_comments",
                &[Filter::is_in("property_id", vec![json!(1), json!(2)])],
            )
            .await
            .unwrap();
        assert_eq!(deleted, 3);
    }

    #[tokio::test]
    async fn test_missing_table() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/rest/v1/activity_logs")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":"PGRST205","message":"Could not find the table"}"#)
            .create_async()
            .await;

        let err = store_for(&server)
            .paginated_read("activity_logs", &[], 0, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::TableNotFound { .. }));
    }

    #[tokio::test]
    async fn test_insert_accepted_without_body_is_not_resent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/rest/v1/properties")
            .match_query(Matcher::Any)
            .with_status(201)
            .expect(1)
            .create_async()
            .await;

        let retry = RetryConfig::new()
            .with_max_attempts(4)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);
        let loader = BatchLoader::new(Arc::new(store_for(&server)), LoaderConfig::new().with_retry(retry));
        let record = ResolvedRecord {
            source_row: 1,
            source_hash: "h1".into(),
            listing: ListingFields {
                name: Some("래미안 퍼스티지".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        let outcome = loader.load(&[record], &CancellationToken::new()).await;

        assert_eq!(outcome.inserted(), 1);
        assert_eq!(outcome.failed(), 0);
        assert_eq!(outcome.batches[0].requests, 1);
        assert!(outcome.batches[0].inserted_ids.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_malformed_read_body_is_not_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/rest/v1/properties")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":1,"name":"#)
            .create_async()
            .await;

        let err = store_for(&server)
            .paginated_read("properties", &[], 0, 10)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(matches!(err, MigrateError::Store { status: Some(200), .. }));
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/rest/v1/users")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "3")
            .create_async()
            .await;

        let err = store_for(&server).fetch_all("users").await.unwrap_err();
        assert!(matches!(
            err,
            MigrateError::RateLimited {
                retry_after_secs: Some(3),
                ..
            }
        ));
        assert!(err.is_transient());
    }
}
