//! Retry policy for chain requests and block processing.
//!
//! The same exponential schedule drives two loops: [`RetryPolicy::execute`] retries a
//! single RPC call in place, and the sync engine uses [`RetryPolicy::delay_for`] to
//! back off between attempts at a failing block.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries, just try once)
    pub max_retries: u32,

    pub initial_backoff: Duration,

    /// Upper bound of a single delay.
    pub max_backoff: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential backoff)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Creates a policy with no retries (fail immediately).
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before the `attempt`-th retry (1-based): `initial * multiplier^(attempt - 1)`,
    /// capped at `max_backoff`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    /// Executes `operation`, retrying failures on the configured schedule.
    ///
    /// Returns the last error once `max_retries` retries are exhausted.
    ///
    /// ```rust,ignore
    /// let head = policy.execute(|| async {
    ///     provider.block_number().await.context("block_number")
    /// }).await?;
    /// ```
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempts > 0 {
                        tracing::info!(
                            target: "auco::etl::retry",
                            "Operation succeeded after {} attempt(s)",
                            attempts + 1
                        );
                    }
                    return Ok(result);
                }
                Err(err) => {
                    attempts += 1;

                    if attempts > self.max_retries {
                        tracing::error!(
                            target: "auco::etl::retry",
                            "Operation failed after {} attempts: {:#}",
                            attempts,
                            err
                        );
                        return Err(err);
                    }

                    let backoff = self.delay_for(attempts);
                    tracing::warn!(
                        target: "auco::etl::retry",
                        "Operation failed (attempt {}/{}): {:#}. Retrying in {:?}...",
                        attempts,
                        self.max_retries + 1,
                        err,
                        backoff
                    );

                    sleep(backoff).await;
                }
            }
        }
    }
}
