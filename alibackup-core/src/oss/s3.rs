/*!
OSS client over the S3-compatible API.

OSS accepts S3 requests on its regional endpoints, so the official AWS SDK is
used with static credentials (plus the STS session token when role-based) and
the endpoint derived by [`crate::client::oss_endpoint`].
*/

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use aws_sdk_s3::Client as S3Client;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ListPage, ListRequest, ObjectStoreApi};
use crate::client::ClientBuilder;
use crate::config::DEFAULT_REGION;
use crate::credentials::CredentialSet;
use crate::{ApiError, Result};

const CREDENTIALS_PROVIDER_NAME: &str = "alibackup";

/// [`ObjectStoreApi`] backed by the AWS SDK S3 client
#[derive(Debug, Clone)]
pub struct OssS3Client {
    client: S3Client,
}

impl OssS3Client {
    /// Build a client for `endpoint`, signing with `credentials`.
    ///
    /// # Arguments
    /// * `credentials` - Access keys and optional session token
    /// * `endpoint` - OSS endpoint URL; the SDK default is used when `None`
    /// * `region` - Signing region; defaults to the canonical default region
    pub fn new(credentials: &CredentialSet, endpoint: Option<&str>, region: Option<&str>) -> Self {
        let provider = Credentials::new(
            credentials.access_key_id(),
            credentials.access_key_secret(),
            credentials.session_token().map(str::to_string),
            None,
            CREDENTIALS_PROVIDER_NAME,
        );

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.unwrap_or(DEFAULT_REGION).to_string()))
            .credentials_provider(provider);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        debug!(endpoint = ?endpoint, region = ?region, "Built OSS client");
        Self {
            client: S3Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl ObjectStoreApi for OssS3Client {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        kms_key_id: Option<String>,
    ) -> std::result::Result<(), ApiError> {
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body));
        if let Some(kms_key_id) = kms_key_id {
            request = request
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(kms_key_id);
        }

        request
            .send()
            .await
            .map(|_| ())
            .map_err(|e| map_sdk_error("PutObject", e))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> std::result::Result<(), ApiError> {
        self.client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| map_sdk_error("HeadObject", e))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> std::result::Result<Bytes, ApiError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("GetObject", e))?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ApiError::new(format!("GetObject body read failed: {e}")))?;
        Ok(body.into_bytes())
    }

    async fn list_objects_v2(&self, request: &ListRequest) -> std::result::Result<ListPage, ApiError> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&request.bucket)
            .prefix(&request.prefix)
            .set_delimiter(request.delimiter.clone())
            .max_keys(request.max_keys)
            .set_continuation_token(request.continuation_token.clone())
            .send()
            .await
            .map_err(|e| map_sdk_error("ListObjectsV2", e))?;

        Ok(ListPage {
            keys: output
                .contents()
                .iter()
                .filter_map(|object| object.key().map(str::to_string))
                .collect(),
            common_prefixes: output
                .common_prefixes()
                .iter()
                .filter_map(|prefix| prefix.prefix().map(str::to_string))
                .collect(),
            is_truncated: output.is_truncated().unwrap_or(false),
            next_continuation_token: output.next_continuation_token().map(str::to_string),
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> std::result::Result<(), ApiError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| map_sdk_error("DeleteObject", e))
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> std::result::Result<String, ApiError> {
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| ApiError::new(format!("invalid presign expiry {ttl:?}: {e}")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| map_sdk_error("PresignGetObject", e))?;
        Ok(presigned.uri().to_string())
    }
}

/// Builds [`OssS3Client`]s for the object store adapter
#[derive(Debug, Clone, Copy, Default)]
pub struct OssClientBuilder;

impl ClientBuilder for OssClientBuilder {
    type Client = dyn ObjectStoreApi;

    fn build(
        &self,
        credentials: &CredentialSet,
        endpoint: Option<&str>,
        region: Option<&str>,
    ) -> Result<Arc<dyn ObjectStoreApi>> {
        Ok(Arc::new(OssS3Client::new(credentials, endpoint, region)))
    }
}

/// Map AWS SDK errors to [`ApiError`], keeping the service code and HTTP status
fn map_sdk_error<E>(operation: &str, error: SdkError<E, HttpResponse>) -> ApiError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match &error {
        SdkError::DispatchFailure(dispatch_err) => {
            ApiError::new(format!("{operation} request failed to dispatch: {dispatch_err:?}"))
        }
        SdkError::TimeoutError(_) => ApiError::new(format!("{operation} request timed out")),
        SdkError::ResponseError(response_err) => {
            ApiError::new(format!("{operation} response could not be parsed"))
                .with_status(response_err.raw().status().as_u16())
        }
        SdkError::ServiceError(service_err) => {
            let err = service_err.err();
            let mut api_error = ApiError::new(err.message().unwrap_or("unknown error"))
                .with_status(service_err.raw().status().as_u16());
            if let Some(code) = err.code() {
                api_error = api_error.with_code(code);
            }
            api_error
        }
        _ => ApiError::new(format!("{operation} error: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::head_object::HeadObjectError;

    #[test]
    fn test_timeout_error_mapping() {
        let timeout = SdkError::<HeadObjectError, HttpResponse>::timeout_error("deadline exceeded");
        let mapped = map_sdk_error("HeadObject", timeout);

        assert!(mapped.message.contains("HeadObject"));
        assert!(mapped.message.contains("timed out"));
        assert!(!mapped.is_not_found());
    }

    #[test]
    fn test_builder_accepts_session_credentials() {
        let credentials =
            CredentialSet::static_keys("ak", "sk", Some("session-token".to_string()));
        let client = OssClientBuilder.build(
            &credentials,
            Some("https://oss-cn-beijing.aliyuncs.com"),
            Some("cn-beijing"),
        );
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_presigned_url_targets_endpoint() {
        let credentials = CredentialSet::static_keys("ak", "sk", None);
        let client = OssS3Client::new(
            &credentials,
            Some("https://oss-cn-beijing.aliyuncs.com"),
            Some("cn-beijing"),
        );

        let url = client
            .presign_get("backups", "restic/repo/config", Duration::from_secs(600))
            .await
            .unwrap();
        assert!(url.contains("oss-cn-beijing.aliyuncs.com"));
        assert!(url.contains("restic/repo/config"));
        assert!(url.contains("X-Amz-Expires=600"));
    }
}
