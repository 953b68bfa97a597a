//! Object store wrapper that injects failures.

use crate::errors::StoreError;
use crate::store::{ListPage, ObjectBody, ObjectStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Delegates to another store, failing some requests on purpose.
pub struct FlakyObjectStore {
    inner: Arc<dyn ObjectStore>,
    get_failures_left: AtomicUsize,
    failures: AtomicUsize,
    failing_puts: Mutex<Option<String>>,
}

impl FlakyObjectStore {
    /// Wraps `inner`, failing the first `get_failures` object reads.
    #[must_use]
    pub fn new(inner: Arc<dyn ObjectStore>, get_failures: usize) -> Self {
        Self {
            inner,
            get_failures_left: AtomicUsize::new(get_failures),
            failures: AtomicUsize::new(0),
            failing_puts: Mutex::new(None),
        }
    }

    /// Fails every put whose key contains `pattern`.
    #[must_use]
    pub fn fail_puts_matching(self, pattern: impl Into<String>) -> Self {
        *self.failing_puts.lock() = Some(pattern.into());
        self
    }

    /// Returns the number of injected failures so far.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn injected(&self, bucket: &str, key: &str) -> StoreError {
        self.failures.fetch_add(1, Ordering::SeqCst);
        StoreError::request(bucket, key, "injected failure")
    }
}

impl std::fmt::Debug for FlakyObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyObjectStore")
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ObjectStore for FlakyObjectStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListPage, StoreError> {
        self.inner.list_objects(bucket, prefix, continuation_token).await
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError> {
        let should_fail = self
            .get_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(self.injected(bucket, key));
        }
        self.inner.get_object(bucket, key).await
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        let fails = self
            .failing_puts
            .lock()
            .as_deref()
            .is_some_and(|pattern| key.contains(pattern));
        if fails {
            return Err(self.injected(bucket, key));
        }
        self.inner.put_object(bucket, key, body).await
    }
}
