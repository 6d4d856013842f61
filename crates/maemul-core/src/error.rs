//! Error types for the maemul migration pipeline.
//!
//! Every failure the pipeline can observe is one `MigrateError` variant. The
//! classification helpers at the bottom decide how the Batch Loader reacts:
//! retry (transient), bisect (non-transient or size-limit), or abort the run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the migration pipeline.
#[derive(Debug, Error)]
pub enum MigrateError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited on {table}, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        table: String,
        retry_after_secs: Option<u64>,
    },

    // Record store errors
    #[error("Store rejected request on {table} (status {status:?}, code {code:?}): {message}")]
    Store {
        table: String,
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("Request to {table} exceeded the store size limit ({rows} rows): {message}")]
    PayloadTooLarge {
        table: String,
        rows: usize,
        message: String,
    },

    #[error("Table not found: {table}")]
    TableNotFound { table: String },

    #[error("Failed to load reference table {table}: {message}")]
    ReferenceFetch { table: String, message: String },

    #[error("Connectivity lost after {consecutive_failures} failed attempts to reach the store")]
    ConnectivityLost { consecutive_failures: u32 },

    // Input errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("CSV error: {message}")]
    Csv {
        message: String,
        #[source]
        source: Option<csv::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(PathBuf),

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

/// Failure category used in the migration report's breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retry budget exhausted on a transient error.
    Transient,
    /// The store rejected the row (constraint violation, malformed payload).
    Rejected,
    /// The request exceeded the store's row/payload cap even at a single row.
    SizeLimit,
    /// Record excluded before loading because a label did not resolve (strict mode).
    Unresolved,
    /// The run stopped before the row's batch was attempted.
    Aborted,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Transient => "transient",
            FailureKind::Rejected => "rejected",
            FailureKind::SizeLimit => "size_limit",
            FailureKind::Unresolved => "unresolved",
            FailureKind::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        MigrateError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        MigrateError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<csv::Error> for MigrateError {
    fn from(err: csv::Error) -> Self {
        MigrateError::Csv {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for MigrateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MigrateError::Timeout(Duration::from_secs(0))
        } else {
            MigrateError::Network {
                message: err.to_string(),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }
}

impl MigrateError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        MigrateError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether a retry of the same request might succeed.
    ///
    /// Timeouts, connection failures, rate limiting and 408/429/5xx store
    /// statuses are transient. Everything else is a property of the payload.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrateError::Network { .. }
            | MigrateError::Timeout(_)
            | MigrateError::RateLimited { .. } => true,
            MigrateError::Store {
                status: Some(status),
                ..
            } => is_transient_status(*status),
            _ => false,
        }
    }

    /// Whether the store could not be reached at all. Rate limiting and 5xx
    /// replies are transient but prove the store is there.
    pub fn is_connectivity_failure(&self) -> bool {
        matches!(self, MigrateError::Network { .. } | MigrateError::Timeout(_))
    }

    /// Whether the store refused the request for its size rather than its content.
    pub fn is_size_limit(&self) -> bool {
        matches!(self, MigrateError::PayloadTooLarge { .. })
    }

    /// Conditions that abort the whole run instead of a subset of rows.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            MigrateError::ReferenceFetch { .. } | MigrateError::ConnectivityLost { .. }
        )
    }

    /// Report category for a row that ended with this error.
    pub fn failure_kind(&self) -> FailureKind {
        if self.is_size_limit() {
            FailureKind::SizeLimit
        } else if self.is_transient() {
            FailureKind::Transient
        } else if self.is_run_fatal() {
            FailureKind::Aborted
        } else {
            FailureKind::Rejected
        }
    }
}

/// HTTP statuses worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrateError::TableNotFound {
            table: "properties".into(),
        };
        assert_eq!(err.to_string(), "Table not found: properties");
    }

    #[test]
    fn test_transient_classification() {
        assert!(MigrateError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(MigrateError::Network {
            message: "connection reset".into(),
            cause: None,
        }
        .is_transient());
        assert!(MigrateError::Store {
            table: "properties".into(),
            status: Some(503),
            code: None,
            message: "unavailable".into(),
        }
        .is_transient());
        assert!(!MigrateError::Store {
            table: "properties".into(),
            status: Some(409),
            code: Some("23505".into()),
            message: "duplicate key".into(),
        }
        .is_transient());
    }

    #[test]
    fn test_only_unreachable_store_is_connectivity_failure() {
        assert!(MigrateError::Timeout(Duration::from_secs(5)).is_connectivity_failure());
        assert!(MigrateError::Network {
            message: "connection refused".into(),
            cause: None,
        }
        .is_connectivity_failure());

        let throttled = MigrateError::RateLimited {
            table: "properties".into(),
            retry_after_secs: Some(1),
        };
        assert!(throttled.is_transient());
        assert!(!throttled.is_connectivity_failure());

        let unavailable = MigrateError::Store {
            table: "properties".into(),
            status: Some(503),
            code: None,
            message: "unavailable".into(),
        };
        assert!(unavailable.is_transient());
        assert!(!unavailable.is_connectivity_failure());
    }

    #[test]
    fn test_size_limit_is_not_transient() {
        let err = MigrateError::PayloadTooLarge {
            table: "properties".into(),
            rows: 500,
            message: "too large".into(),
        };
        assert!(err.is_size_limit());
        assert!(!err.is_transient());
        assert_eq!(err.failure_kind(), FailureKind::SizeLimit);
    }

    #[test]
    fn test_run_fatal() {
        assert!(MigrateError::ReferenceFetch {
            table: "property_types".into(),
            message: "401".into(),
        }
        .is_run_fatal());
        assert!(!MigrateError::Timeout(Duration::from_secs(1)).is_run_fatal());
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::Rejected.to_string(), "rejected");
        assert_eq!(FailureKind::SizeLimit.to_string(), "size_limit");
    }
}
