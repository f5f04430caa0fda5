//! Retry utilities with exponential backoff and jitter.
//!
//! Used for the two network-bound steps of a reconciliation pass: subject
//! resolution and status updates. Retries stop early when the error is not
//! retryable or the caller's [`CancellationToken`] fires. Resource-version
//! conflicts are retried immediately, without sleeping.
//!
//! # Example
//!
//! ```ignore
//! use daytona_binding::retry::{retry_with_backoff, RetryConfig};
//!
//! let subject = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(5),
//!     "resolve_subject",
//!     &cancel,
//!     || async { ctx.client.resolve_subject(&namespace, &subject).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Returns as soon as the operation succeeds, fails with a non-retryable
/// error, exhausts `max_attempts`, or `cancel` is triggered. On cancellation
/// the in-flight attempt is dropped and [`Error::Cancelled`] is returned.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(operation_name)),
            result = operation() => result,
        };

        let e = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !e.is_retryable() {
            return Err(e);
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(e);
        }

        // Conflicts mean our read is stale; re-read right away.
        if e.is_conflict() {
            warn!(
                operation = %operation_name,
                attempt = attempt,
                "Conflict, retrying immediately"
            );
            continue;
        }

        // Add jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = jittered_delay.as_millis(),
            "Operation failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(operation_name)),
            _ = tokio::time::sleep(jittered_delay) => {}
        }

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
