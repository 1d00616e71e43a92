// SPDX-License-Identifier: MIT
//! Exponential backoff retry for calls to the task queue.
//!
//! [`retry_with_backoff`] retries a fallible async operation with
//! exponentially increasing delays, but only while the caller's
//! `is_retryable` predicate says the failure is worth another attempt.
//! Business-logic rejections (401, 404, other 4xx) fail immediately;
//! transient network weather gets up to three tries.

use std::time::Duration;

use tracing::{debug, warn};

/// Configuration for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled after each failure.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the previous delay on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config suitable for quick unit tests (no real waiting).
    pub fn instant() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Calls `f()` up to `config.max_attempts` times. A failure is retried only
/// when `is_retryable(&err)` returns true; otherwise the error is returned
/// at once. Returns `Ok` on the first success or the last error after all
/// attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    is_retryable: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) if attempt < config.max_attempts && is_retryable(&e) => {
                warn!(
                    attempt,
                    max = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    err = %e,
                    "transient failure — retrying"
                );
                tokio::time::sleep(delay).await;
                let next_ms = (delay.as_millis() as f64 * config.multiplier) as u128;
                delay = Duration::from_millis(next_ms.min(config.max_delay.as_millis()) as u64);
            }
            Err(e) => return Err(e),
        }
    }
}
