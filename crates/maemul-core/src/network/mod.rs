//! Resilience primitives for talking to the remote record store.
//!
//! - Exponential backoff with jitter, transient-only retry
//! - Cross-batch circuit breaker for connectivity loss

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use retry::{retry_transient, RetryConfig};
