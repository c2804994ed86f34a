//! Bounded retries with exponential backoff for fallible remote calls.
//!
//! Transient failures (network, timeout, rate limit) are retried with a
//! delay of `base_delay * 2^attempt * jitter`, jitter uniform in
//! [0.5, 1.0]. Non-retryable errors and exhausted budgets propagate the
//! failure to the caller; nothing is swallowed.

use std::future::Future;
use std::time::Duration;

use crate::error::ExtractError;

/// Retry settings for a fallible asynchronous call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least one call is always made.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Backoff before the retry following failed attempt `attempt` (0-based).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let doubled = self.base_delay.as_millis() as u64 * (1u64 << attempt.min(16));
        Duration::from_millis((doubled as f64 * jitter_factor()) as u64)
    }
}

/// Run `op` under `policy`, suspending the calling task between attempts.
///
/// Only errors reporting [`ExtractError::is_retryable`] are retried;
/// anything else propagates immediately.
pub async fn run_with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, ExtractError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExtractError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if !e.is_retryable() || attempt >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.backoff_delay(attempt - 1);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Bound `fut` to `limit`, mapping elapsed time to [`ExtractError::Timeout`].
///
/// Applied per remote call so a single stuck call cannot hold a permit
/// indefinitely.
pub async fn run_with_timeout<T, Fut>(limit: Duration, fut: Fut) -> Result<T, ExtractError>
where
    Fut: Future<Output = Result<T, ExtractError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExtractError::Timeout(limit.as_secs())),
    }
}

// ---------------------------------------------------------------------------
// Jitter without the `rand` crate: xorshift seeded from the clock.
// Not cryptographic, only here to decorrelate concurrent retries.
// ---------------------------------------------------------------------------

/// Uniform multiplier in [0.5, 1.0].
fn jitter_factor() -> f64 {
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    0.5 + 0.5 * ((x % 1000) as f64 / 1000.0)
}
