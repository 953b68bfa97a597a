//! Object store backed by Amazon S3.

use super::{ListPage, ObjectBody, ObjectStore, ObjectSummary};
use crate::errors::StoreError;
use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Output;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

/// [`ObjectStore`] implementation using the AWS SDK.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Wraps an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the environment, shared config files and
    /// instance metadata.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config))
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore").finish_non_exhaustive()
    }
}

/// Converts one `ListObjectsV2` response into a listing page.
fn list_page(output: ListObjectsV2Output) -> ListPage {
    let truncated = output.is_truncated().unwrap_or(true);
    let next_continuation_token = output
        .next_continuation_token()
        .filter(|_| truncated)
        .map(ToString::to_string);
    let objects = output
        .contents()
        .iter()
        .filter_map(|object| {
            let size = object.size().and_then(|s| u64::try_from(s).ok()).unwrap_or_default();
            object.key().map(|key| ObjectSummary::new(key, size))
        })
        .collect();
    ListPage {
        objects,
        next_continuation_token,
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListPage, StoreError> {
        self.client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map(list_page)
            .map_err(|e| StoreError::request(bucket, prefix, DisplayErrorContext(&e).to_string()))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::get_object::GetObjectError::is_no_such_key);
                if not_found {
                    StoreError::not_found(bucket, key)
                } else {
                    StoreError::request(bucket, key, DisplayErrorContext(&e).to_string())
                }
            })?;
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| StoreError::request(bucket, key, DisplayErrorContext(&e).to_string()))
    }
}
