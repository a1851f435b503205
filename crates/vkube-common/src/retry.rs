//! Backoff helpers
//!
//! [`RetryConfig::delay_for_attempt`] is the schedule shared with the work
//! queue. [`retry_with_backoff`] covers startup calls (discovery, namespace
//! creation); [`retry_on_conflict`] covers read-modify-write loops that must
//! re-read after a 409.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Exponential backoff schedule
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts before giving up; 0 retries forever
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound of any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default schedule that gives up after `max_attempts`
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before the given attempt (1-based), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(32) as i32);
        Duration::from_secs_f64(
            (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64()),
        )
    }
}

fn jittered(delay: Duration) -> Duration {
    Duration::from_secs_f64(delay.as_secs_f64() * rand::thread_rng().gen_range(0.5..1.5))
}

/// Shared loop: re-run `operation` while `should_retry` accepts the error
async fn retry_while<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !should_retry(&err) => return Err(err),
            Err(err) => err,
        };
        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(operation = %operation_name, attempt, error = %err, "giving up after max attempts");
            return Err(err);
        }
        let delay = jittered(config.delay_for_attempt(attempt));
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Run a startup-time operation until it succeeds or `max_attempts` is spent.
///
/// Every error is retried; the last one is returned on exhaustion.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_while(config, operation_name, |_| true, operation).await
}

/// Re-run a read-modify-write operation while it fails with a conflict.
///
/// Any other error is returned immediately. The closure must re-read the
/// object on every call so the retried write carries a fresh resourceVersion.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    retry_while(config, operation_name, Error::is_conflict, operation).await
}
