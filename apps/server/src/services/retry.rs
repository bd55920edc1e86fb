//! Bounded retry for reindex and erase
//!
//! Only errors that report [`crate::Error::is_retryable`] (lock timeouts,
//! deadlocks) are retried. Every attempt is expected to run in a fresh
//! persistence session.

use crate::config::RetryConfig;
use crate::Result;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the given failed attempt (1-based): exponential, capped,
    /// plus up to 50% random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
            .min(self.max_backoff);
        let spread = exp.as_millis() as u64 / 2;
        if spread == 0 {
            return exp;
        }
        let jitter = (uuid::Uuid::new_v4().as_u128() as u64) % (spread + 1);
        (exp + Duration::from_millis(jitter)).min(self.max_backoff.max(exp))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(label, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::error!(label, attempt, error = %err, "Giving up after retries");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Process `items` in windows of `window` entries, each window retried
    /// through [`RetryPolicy::run`].
    ///
    /// A window that still fails with a retryable error is narrowed to single
    /// items, which then slide through the failed range one at a time before
    /// the window widens again.
    pub async fn run_windowed<T, F, Fut>(
        &self,
        label: &str,
        items: &[String],
        window: usize,
        mut op: F,
    ) -> Result<Vec<T>>
    where
        F: FnMut(Vec<String>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let window = window.max(1);
        let mut size = window;
        let mut narrowed_until: Option<usize> = None;
        let mut position = 0;
        let mut results = Vec::new();

        while position < items.len() {
            let end = (position + size).min(items.len());
            let chunk = &items[position..end];
            match self.run(label, |_| op(chunk.to_vec())).await {
                Ok(value) => {
                    results.push(value);
                    position = end;
                    if narrowed_until.is_some_and(|until| position >= until) {
                        tracing::debug!(label, position, window, "Widening window again");
                        narrowed_until = None;
                        size = window;
                    }
                }
                Err(err) if err.is_retryable() && size > 1 => {
                    tracing::warn!(
                        label,
                        first = %chunk[0],
                        size,
                        "Window keeps conflicting, processing one at a time"
                    );
                    narrowed_until = Some(end);
                    size = 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(results)
    }
}
