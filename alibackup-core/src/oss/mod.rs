/*!
Object storage capability surface.

[`ObjectStoreApi`] is what the object store adapter needs from an OSS client.
[`OssS3Client`] implements it against the S3-compatible OSS API; tests
substitute in-memory doubles.
*/

pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::ApiError;

pub use s3::{OssClientBuilder, OssS3Client};

/// One `ListObjectsV2` request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub bucket: String,
    pub prefix: String,
    pub delimiter: Option<String>,
    pub max_keys: i32,
    pub continuation_token: Option<String>,
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// Object operations against a single OSS endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    /// Upload `body`, encrypting with the given KMS key when set
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        kms_key_id: Option<String>,
    ) -> Result<(), ApiError>;

    /// Succeeds when the object exists
    async fn head_object(&self, bucket: &str, key: &str) -> Result<(), ApiError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, ApiError>;

    async fn list_objects_v2(&self, request: &ListRequest) -> Result<ListPage, ApiError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ApiError>;

    /// Pre-signed GET URL valid for `ttl`
    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, ApiError>;
}
