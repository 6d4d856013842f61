//! Backoff policy for record store calls.
//!
//! The Batch Loader runs its own per-batch state machine and only asks this
//! module how long to wait. One-shot calls (reference tables, auto-created
//! rows, sweeper deletes) go through [`retry_transient`].

use crate::config::LoaderDefaults;
use crate::error::{MigrateError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt budget and backoff curve.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Wait before the first retry; doubles on each further retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each wait by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: LoaderDefaults::RETRY_ATTEMPTS,
            base_delay: LoaderDefaults::RETRY_BASE_DELAY,
            max_delay: LoaderDefaults::RETRY_MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempt` (0-indexed) failed.
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Backoff before the retry that follows `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let doubled = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(30) as i32);
        let mut secs = doubled.min(cap);
        if self.jitter {
            secs = (secs * rand::rng().random_range(0.5..1.5)).min(cap);
        }
        Duration::from_secs_f64(secs)
    }

    /// Backoff after `attempt` failed with `err`. A store that names its own
    /// `Retry-After` is never retried sooner than that.
    pub fn delay_after(&self, attempt: u32, err: &MigrateError) -> Duration {
        let backoff = self.backoff(attempt);
        match err {
            MigrateError::RateLimited {
                retry_after_secs: Some(secs),
                ..
            } => backoff.max(Duration::from_secs(*secs)),
            _ => backoff,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// the attempt budget is spent. `what` names the call in logs.
pub async fn retry_transient<F, Fut, T>(config: &RetryConfig, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = what, attempts = attempt + 1, "Recovered after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(err);
        }
        if !config.has_attempts_left(attempt) {
            warn!(
                operation = what,
                attempts = config.max_attempts,
                error = %err,
                "Giving up after transient failures"
            );
            return Err(err);
        }

        let delay = config.delay_after(attempt, &err);
        debug!(
            operation = what,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
