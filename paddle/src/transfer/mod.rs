//! Staged transfer engine.
//!
//! Moves step data between a local directory tree and a versioned area of
//! an object store. Every object transfer runs as its own task behind a
//! counting admission gate, and every transfer aborts as a whole when one
//! object fails.

mod commit;
mod fetch;
mod inputs;
mod path;

pub use commit::commit_key;
pub use fetch::{local_path, select_objects};
pub use path::{TransferTarget, HEAD};

use crate::cancellation::CancellationToken;
use crate::config::TransferConfig;
use crate::errors::TransferError;
use crate::retry::{with_retry_when, RetryError};
use crate::store::ObjectStore;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, warn};

/// Transfers data between local directories and an object store.
#[derive(Clone)]
pub struct Transfer {
    store: Arc<dyn ObjectStore>,
    config: TransferConfig,
    cancel_token: Arc<CancellationToken>,
}

impl Transfer {
    /// Creates a transfer engine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig) -> Self {
        Self {
            store,
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Binds transfers to an external cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel_token: Arc<CancellationToken>) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Runs a store operation under the retry policy. Only transient
    /// failures are retried.
    async fn retrying<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        operation: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        with_retry_when(
            &self.config.retry,
            cancel,
            what,
            TransferError::is_transient,
            operation,
        )
            .await
            .map_err(|e| match e {
                RetryError::Exhausted(e) => e,
                RetryError::Cancelled(reason) => TransferError::Cancelled(reason),
            })
    }

    /// Runs one task per item with at most `concurrency` in flight.
    ///
    /// The first failure stops admission; tasks already admitted are
    /// drained before the failure is returned. Each task receives a token
    /// that fires on the first failure or on external cancellation.
    async fn admit_all<I, F, Fut, R>(&self, items: I, work: F) -> Result<Vec<R>, TransferError>
    where
        I: IntoIterator,
        F: Fn(I::Item, Arc<CancellationToken>) -> Fut,
        Fut: Future<Output = Result<R, TransferError>> + Send + 'static,
        R: Send + 'static,
    {
        let abort = self.cancel_token.child();
        let permits = self.config.concurrency.clamp(1, Semaphore::MAX_PERMITS);
        let gate = Arc::new(Semaphore::new(permits));
        let mut tasks = JoinSet::new();

        for item in items {
            let permit = tokio::select! {
                biased;
                () = abort.cancelled() => break,
                permit = gate.clone().acquire_owned() => permit
                    .map_err(|e| TransferError::Task(format!("admission gate closed: {e}")))?,
            };

            let task = work(item, abort.clone());
            let abort = abort.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = task.await;
                if let Err(ref e) = result {
                    if !matches!(e, TransferError::Cancelled(_)) {
                        abort.cancel(&e.to_string());
                    }
                }
                result
            });
        }

        let mut results = Vec::new();
        let mut first_error: Option<TransferError> = None;

        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(value)) => {
                    results.push(value);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(join_err) => TransferError::Task(join_err.to_string()),
            };
            let replace = match &first_error {
                None => true,
                Some(TransferError::Cancelled(_)) => !matches!(failure, TransferError::Cancelled(_)),
                Some(_) => false,
            };
            if replace {
                error!(error = %failure, "Object transfer failed");
                first_error = Some(failure);
            } else {
                warn!(error = %failure, "Additional object transfer failure");
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if self.cancel_token.is_cancelled() {
            return Err(TransferError::Cancelled(
                self.cancel_token.reason().unwrap_or_default(),
            ));
        }
        Ok(results)
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("config", &self.config)
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryObjectStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn transfer(concurrency: usize) -> Transfer {
        Transfer::new(
            Arc::new(InMemoryObjectStore::new()),
            TransferConfig::new().with_concurrency(concurrency),
        )
    }

    #[tokio::test]
    async fn test_admission_gate_bounds_in_flight_work() {
        let transfer = transfer(3);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = transfer
            .admit_all(0..20, |i, _abort| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                }
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_stops_admission() {
        let transfer = transfer(1);
        let started = Arc::new(AtomicUsize::new(0));

        let result = transfer
            .admit_all(0..10, |i, _abort| {
                let started = started.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    if i == 1 {
                        Err(TransferError::Task(format!("item {i}")))
                    } else {
                        Ok(i)
                    }
                }
            })
            .await;

        assert!(matches!(result, Err(TransferError::Task(ref m)) if m == "item 1"));
        assert!(started.load(Ordering::SeqCst) < 10);
    }

    #[tokio::test]
    async fn test_external_cancellation_is_reported() {
        let token = CancellationToken::new();
        token.cancel("shutdown");
        let transfer = transfer(4).with_cancel_token(token);

        let result = transfer
            .admit_all(0..3, |i, _abort| async move { Ok(i) })
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled(ref r)) if r == "shutdown"));
    }
}
