//! Connectivity circuit breaker shared by concurrent batch workers.
//!
//! Individual batches retry transient errors on their own. The breaker looks
//! across batches: once too many requests in a row fail to reach the store
//! at all (network errors, timeouts), the store is treated as unreachable and
//! the loader stops dispatching. Throttling and 5xx replies do not count.

use crate::config::LoaderDefaults;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::warn;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow through.
    #[default]
    Closed,
    /// Store considered unreachable; no new batches.
    Open,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before opening.
    pub failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: LoaderDefaults::CONNECTIVITY_FAILURE_THRESHOLD,
        }
    }
}

/// Lock-free breaker; concurrent batch futures share it by reference.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    open: AtomicBool,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    target: String,
}

impl CircuitBreaker {
    pub fn with_config(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            open: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            target: target.into(),
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.open.load(Ordering::SeqCst) {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Any response from the store, including a rejection or a throttle,
    /// proves connectivity.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Record a request that never reached the store; opens the circuit at
    /// the threshold.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::SeqCst);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.failure_threshold && !self.open.swap(true, Ordering::SeqCst) {
            warn!(
                target_store = %self.target,
                failures,
                "Circuit opened: store unreachable"
            );
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            target: self.target.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            total_failures: self.total_failures.load(Ordering::SeqCst),
            total_successes: self.total_successes.load(Ordering::SeqCst),
        }
    }
}

/// Breaker counters, carried into the run report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub target: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::with_config(
            "properties",
            CircuitBreakerConfig {
                failure_threshold: threshold,
            },
        )
    }

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::with_config("properties", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats(), CircuitBreakerStats {
            target: "properties".into(),
            ..Default::default()
        });
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());
        cb.record_failure();
        assert!(cb.is_open());
        assert_eq!(cb.consecutive_failures(), 3);
    }

    #[test]
    fn test_success_resets_streak() {
        let cb = breaker(3);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());

        let stats = cb.stats();
        assert_eq!(stats.total_failures, 4);
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.consecutive_failures, 2);
    }

    #[test]
    fn test_stats_serialize_for_report() {
        let cb = breaker(1);
        cb.record_failure();
        let json = serde_json::to_value(cb.stats()).unwrap();
        assert_eq!(json["state"], "open");
        assert_eq!(json["total_failures"], 1);
    }
}
