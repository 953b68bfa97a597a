//! Object store client capability.
//!
//! The transfer engine only needs three operations from a bucket-style
//! store: a paginated prefix listing, a streaming get and a put. Any
//! backend exposing them can be plugged in through [`ObjectStore`].

mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use memory::InMemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

use crate::errors::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Streaming body of a fetched object.
pub type ObjectBody = Pin<Box<dyn AsyncRead + Send>>;

/// One entry of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    /// The full object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
}

impl ObjectSummary {
    /// Creates a listing entry.
    #[must_use]
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
        }
    }

    /// Returns true for directory marker keys, which are never materialized.
    #[must_use]
    pub fn is_directory_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Objects in this page.
    pub objects: Vec<ObjectSummary>,
    /// Token for the next page; `None` when the listing is complete.
    pub next_continuation_token: Option<String>,
}

/// Operations the transfer engine needs from an object store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists one page of objects whose key starts with `prefix`.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListPage, StoreError>;

    /// Opens an object for streaming.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError>;

    /// Writes an object, replacing any existing one.
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError>;
}

/// Lists every object under `prefix`, following continuation tokens.
///
/// Pages are requested one after another; the full listing is accumulated
/// before returning.
pub async fn list_all(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
) -> Result<Vec<ObjectSummary>, StoreError> {
    let mut objects = Vec::new();
    let mut token = None;

    loop {
        let page = store.list_objects(bucket, prefix, token).await?;
        objects.extend(page.objects);
        match page.next_continuation_token {
            Some(next) => token = Some(next),
            None => return Ok(objects),
        }
    }
}
