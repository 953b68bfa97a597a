//! In-process object store.

use super::{ListPage, ObjectBody, ObjectStore, ObjectSummary};
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::Cursor;

const DEFAULT_PAGE_SIZE: usize = 1000;

/// An object store held in memory.
///
/// Keys are kept sorted so listings are stable, and listings are paginated
/// with the last returned key as continuation token, which exercises the
/// same pagination path a remote store would.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<(String, String), Vec<u8>>>,
    page_size: usize,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl InMemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of objects per listing page.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Stores an object directly.
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    /// Returns a copy of an object's contents.
    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Returns every key in a bucket, sorted.
    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .read()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Returns the number of stored objects across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if the store holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListPage, StoreError> {
        let objects = self.objects.read();
        let mut matching = objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .filter(|((_, k), _)| continuation_token.as_ref().map_or(true, |after| k > after))
            .map(|((_, k), body)| ObjectSummary::new(k.clone(), body.len() as u64));

        let page: Vec<ObjectSummary> = matching.by_ref().take(self.page_size).collect();
        let next_continuation_token = if matching.next().is_some() {
            page.last().map(|o| o.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            objects: page,
            next_continuation_token,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError> {
        let body = self
            .object(bucket, key)
            .ok_or_else(|| StoreError::not_found(bucket, key))?;
        Ok(Box::pin(Cursor::new(body)))
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        self.insert(bucket, key, body);
        Ok(())
    }
}
