//! Bounded retry with exponential backoff for transient store failures

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{IbcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry_count` (0-based), capped at `max_delay`.
    pub fn backoff_duration(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// `backoff_duration` scaled by a random factor in [0.5, 1.0]
    pub fn jittered(&self, retry_count: u32) -> Duration {
        let delay = self.backoff_duration(retry_count);
        delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_until(what, None, op).await
    }

    /// Like `run`, but never sleeps past `deadline`. Once the next attempt
    /// would start after it, the last error is returned.
    pub async fn run_until<T, F, Fut>(
        &self,
        what: &str,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry_count = 0u32;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() || retry_count + 1 >= self.max_attempts.max(1) {
                return Err(err);
            }

            let delay = self.jittered(retry_count);
            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    return Err(err);
                }
            }

            warn!(
                operation = what,
                attempt = retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient store failure, retrying"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }
}

/// Sleep for `base` plus up to `jitter`
pub fn jittered_interval(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let extra = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
    base + Duration::from_millis(extra)
}

/// Map an error from a retried call into the ownership outcome of a lease.
pub(crate) fn into_lock_not_owned(err: IbcError, name: &str, holder: &str, token: i64) -> IbcError {
    if err.is_transient() {
        IbcError::lock_not_owned(name, holder, token)
    } else {
        err
    }
}
