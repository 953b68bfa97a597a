//! Retry policy for transient object-store failures.
//!
//! The default policy is deliberately simple: a fixed number of attempts
//! separated by a fixed delay. Linear and exponential growth are available
//! for stores that throttle under sustained load.

use crate::cancellation::CancellationToken;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base (constant)
    #[default]
    Constant,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base * 2^attempt
    Exponential,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Delay between attempts in seconds.
    #[serde(default = "default_delay_secs")]
    pub delay_secs: f64,
    /// Cap on the delay in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

fn default_max_attempts() -> usize {
    10
}

fn default_delay_secs() -> f64 {
    10.0
}

fn default_max_delay_secs() -> f64 {
    300.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_secs: default_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            backoff: BackoffStrategy::Constant,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy (10 attempts, 10s apart).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_secs = delay.as_secs_f64();
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Returns the delay to wait after the given failed attempt (0-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.delay_secs.max(0.0);
        let factor = match self.backoff {
            BackoffStrategy::Constant => 1.0,
            #[allow(clippy::cast_precision_loss)]
            BackoffStrategy::Linear => (attempt + 1) as f64,
            BackoffStrategy::Exponential => 2f64.powi(i32::try_from(attempt).unwrap_or(i32::MAX)),
        };
        Duration::from_secs_f64((base * factor).min(self.max_delay_secs.max(base)))
    }
}

/// Why a retried operation stopped without succeeding.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error.
    Exhausted(E),
    /// The token was cancelled while waiting between attempts.
    Cancelled(String),
}

/// Executes an operation, retrying failures according to `policy`.
///
/// The wait between attempts is abandoned as soon as `cancel` fires.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_when(policy, cancel, what, |_| true, operation).await
}

/// Like [`with_retry`], but only failures accepted by `retryable` are
/// retried; any other failure is returned at once as
/// [`RetryError::Exhausted`].
pub async fn with_retry_when<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts || !retryable(&e) {
                    return Err(RetryError::Exhausted(e));
                }
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    operation = what,
                    attempt,
                    max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    error = %e,
                    "Operation failed, will retry"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        return Err(RetryError::Cancelled(cancel.reason().unwrap_or_default()));
                    }
                }
            }
        }
    }
}
