//! Retry with exponential backoff.
//!
//! Used for connecting, page fetches and sink batch delivery. Only errors
//! classified as transient are retried.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: u32,
    /// Initial delay before first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Retry configuration that never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial and maximum backoff in milliseconds.
    #[must_use]
    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_delay_ms = initial_ms;
        self.max_delay_ms = max_ms;
        self
    }

    /// Disable jitter (deterministic delays).
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct Retried<T> {
    /// Final result.
    pub result: SyncResult<T>,
    /// Number of retries performed (0 if the first attempt settled it).
    pub retries: u32,
}

/// Retry executor with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor with the given configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create a new retry executor with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Get the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Calculate delay for a given attempt (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);

        let delay_ms = base_delay.min(self.config.max_delay_ms as f64);

        let final_delay = if self.config.jitter {
            // Up to 25% jitter
            delay_ms * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Delay before the next attempt, or `None` when `error` is permanent or
    /// `attempt` retries have already used up the budget.
    pub fn retry_delay(&self, error: &SyncError, attempt: u32) -> Option<Duration> {
        if !error.is_transient() || attempt >= self.config.max_retries {
            return None;
        }
        Some(self.calculate_delay(attempt))
    }

    /// Execute an operation with retries.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = SyncResult<T>>,
    {
        self.execute_tracked(operation).await.result
    }

    /// Execute an operation with retries, reporting how many were needed.
    pub async fn execute_tracked<F, Fut, T>(&self, operation: F) -> Retried<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = SyncResult<T>>,
    {
        self.run(None, operation).await
    }

    /// Like [`execute_tracked`](Self::execute_tracked), but a cancelled
    /// `cancel` token cuts the backoff short with [`SyncError::Cancelled`].
    /// An attempt already in progress is not interrupted.
    pub async fn execute_cancellable<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Retried<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = SyncResult<T>>,
    {
        self.run(Some(cancel), operation).await
    }

    async fn run<F, Fut, T>(
        &self,
        cancel: Option<&CancellationToken>,
        mut operation: F,
    ) -> Retried<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = SyncResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    return Retried {
                        result: Ok(value),
                        retries: attempt,
                    }
                }
                Err(e) => {
                    let Some(delay) = self.retry_delay(&e, attempt) else {
                        return Retried {
                            result: Err(e),
                            retries: attempt,
                        };
                    };

                    debug!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );

                    match cancel {
                        Some(token) => {
                            tokio::select! {
                                () = token.cancelled() => {
                                    let e = SyncError::cancelled("cancelled during retry backoff");
                                    return Retried {
                                        result: Err(e),
                                        retries: attempt,
                                    };
                                }
                                () = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_retries(max_retries)
            .with_backoff(1, 5)
            .without_jitter()
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let executor = RetryExecutor::new(
            RetryConfig::default()
                .with_backoff(100, 1000)
                .without_jitter(),
        );

        assert_eq!(executor.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(executor.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(executor.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(executor.calculate_delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let executor = RetryExecutor::new(RetryConfig::default().with_backoff(100, 1000));
        for _ in 0..50 {
            let delay = executor.calculate_delay(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_retry_delay_decision() {
        let executor = RetryExecutor::new(fast_config(2));
        assert!(executor
            .retry_delay(&SyncError::transient_read("busy"), 0)
            .is_some());
        assert!(executor
            .retry_delay(&SyncError::transient_read("busy"), 2)
            .is_none());
        assert!(executor
            .retry_delay(&SyncError::protocol("garbled"), 0)
            .is_none());
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let executor = RetryExecutor::new(fast_config(3));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let outcome = executor
            .execute_tracked(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SyncError::transient_read("busy"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let executor = RetryExecutor::new(fast_config(2));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let outcome: Retried<()> = executor
            .execute_tracked(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::sink_delivery("down"))
                }
            })
            .await;

        assert!(matches!(outcome.result, Err(SyncError::SinkDelivery { .. })));
        assert_eq!(outcome.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let executor = RetryExecutor::new(fast_config(5));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: SyncResult<()> = executor
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::protocol("garbled"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_never_retries() {
        let executor = RetryExecutor::new(RetryConfig::disabled());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: SyncResult<()> = executor
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::connectivity("refused"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_cuts_backoff_short() {
        let executor = RetryExecutor::new(
            RetryConfig::default()
                .with_max_retries(5)
                .with_backoff(60_000, 60_000)
                .without_jitter(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let outcome: Retried<()> = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute_cancellable(&cancel, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::transient_read("busy"))
                }
            }),
        )
        .await
        .expect("backoff should not wait out the delay");

        assert!(matches!(outcome.result, Err(SyncError::Cancelled { .. })));
        assert_eq!(outcome.retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_uncancelled_token_still_retries() {
        let executor = RetryExecutor::new(fast_config(3));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let outcome = executor
            .execute_cancellable(&cancel, || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                        Err(SyncError::connectivity("refused"))
                    } else {
                        Ok("bound")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "bound");
        assert_eq!(outcome.retries, 1);
    }
}
