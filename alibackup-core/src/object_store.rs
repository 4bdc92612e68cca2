/*!
Object store adapter over OSS.

Every capability call obtains its client from a [`RefreshingClient`], so a
role-based session is re-exchanged and the client rebuilt before the call is
made. Listings paginate transparently in fixed-size pages.
*/

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::client::{oss_endpoint, ClientBuilder, RefreshingClient};
use crate::config::{PluginConfig, DEFAULT_REGION, ENV_ENCRYPTION_KEY_ID, OBJECT_STORE_CONFIG_KEYS};
use crate::observability::{observed, Provider};
use crate::oss::{ListPage, ListRequest, ObjectStoreApi, OssClientBuilder};
use crate::plugin::{ObjectStorePlugin, PluginContext};
use crate::{PluginError, Result};

/// Keys requested per `ListObjectsV2` round-trip
pub const LIST_PAGE_SIZE: i32 = 50;

struct ObjectStoreState {
    client: RefreshingClient<dyn ObjectStoreApi>,
    encryption_key_id: Option<String>,
}

/// OSS-backed object store
pub struct ObjectStore {
    context: PluginContext,
    builder: Arc<dyn ClientBuilder<Client = dyn ObjectStoreApi>>,
    state: Option<ObjectStoreState>,
}

impl ObjectStore {
    pub fn new(context: PluginContext) -> Self {
        Self::with_client_builder(context, Arc::new(OssClientBuilder))
    }

    /// Object store that builds its clients through `builder`
    pub fn with_client_builder(
        context: PluginContext,
        builder: Arc<dyn ClientBuilder<Client = dyn ObjectStoreApi>>,
    ) -> Self {
        Self {
            context,
            builder,
            state: None,
        }
    }

    fn state(&self) -> Result<&ObjectStoreState> {
        self.state
            .as_ref()
            .ok_or_else(|| PluginError::config("object store is not initialized"))
    }

    async fn client(&self) -> Result<Arc<dyn ObjectStoreApi>> {
        self.state()?.client.current().await
    }

    /// Collect every page of a listing, `extract` picking the wanted entries
    async fn list_all<F>(&self, mut request: ListRequest, mut extract: F) -> Result<Vec<String>>
    where
        F: FnMut(ListPage) -> (Vec<String>, bool, Option<String>),
    {
        let client = self.client().await?;
        let resource = format!("{}/{}", request.bucket, request.prefix);
        let mut entries = Vec::new();
        let mut pages = 0usize;

        loop {
            let page = observed(
                Provider::Oss,
                "ListObjectsV2",
                &resource,
                client.list_objects_v2(&request),
            )
            .await?;
            pages += 1;

            let (mut found, truncated, next) = extract(page);
            entries.append(&mut found);

            match next.filter(|token| truncated && !token.is_empty()) {
                Some(token) => request.continuation_token = Some(token),
                None => break,
            }
        }

        debug!(resource = %resource, pages, entries = entries.len(), "Listing complete");
        Ok(entries)
    }
}

#[async_trait]
impl ObjectStorePlugin for ObjectStore {
    async fn init(&mut self, config: &HashMap<String, String>) -> Result<()> {
        let config = PluginConfig::from_map(config, OBJECT_STORE_CONFIG_KEYS)?;
        let env = self.context.env();

        let region = self
            .context
            .metadata()
            .region_or(config.region.as_deref(), DEFAULT_REGION)
            .await;
        let endpoint = oss_endpoint(config.endpoint.as_deref(), &region, config.network);
        let encryption_key_id = env.get(ENV_ENCRYPTION_KEY_ID).map(str::to_string);

        let managed = config.is_managed_environment(env);
        let resolver = self.context.credential_resolver();
        let credentials = resolver.resolve(&config, env, managed).await?;

        let client: RefreshingClient<dyn ObjectStoreApi> = RefreshingClient::new(
            Arc::clone(&self.builder),
            resolver.refresher().clone(),
            credentials,
            Some(&endpoint),
            Some(&region),
        )?;

        info!(
            region = %region,
            endpoint = %endpoint,
            encrypted = encryption_key_id.is_some(),
            "Object store initialized"
        );
        self.state = Some(ObjectStoreState {
            client,
            encryption_key_id,
        });
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        let kms_key_id = self.state()?.encryption_key_id.clone();
        let client = self.client().await?;
        observed(
            Provider::Oss,
            "PutObject",
            &format!("{bucket}/{key}"),
            client.put_object(bucket, key, body, kms_key_id),
        )
        .await
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let client = self.client().await?;
        match observed(
            Provider::Oss,
            "HeadObject",
            &format!("{bucket}/{key}"),
            client.head_object(bucket, key),
        )
        .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let client = self.client().await?;
        observed(
            Provider::Oss,
            "GetObject",
            &format!("{bucket}/{key}"),
            client.get_object(bucket, key),
        )
        .await
    }

    async fn list_common_prefixes(&self, bucket: &str, prefix: &str, delimiter: &str) -> Result<Vec<String>> {
        let request = ListRequest {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            delimiter: Some(delimiter.to_string()).filter(|d| !d.is_empty()),
            max_keys: LIST_PAGE_SIZE,
            continuation_token: None,
        };
        self.list_all(request, |page| {
            (page.common_prefixes, page.is_truncated, page.next_continuation_token)
        })
        .await
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let request = ListRequest {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            delimiter: None,
            max_keys: LIST_PAGE_SIZE,
            continuation_token: None,
        };
        self.list_all(request, |page| (page.keys, page.is_truncated, page.next_continuation_token))
            .await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let client = self.client().await?;
        observed(
            Provider::Oss,
            "DeleteObject",
            &format!("{bucket}/{key}"),
            client.delete_object(bucket, key),
        )
        .await
    }

    async fn create_signed_url(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        let client = self.client().await?;
        observed(
            Provider::Oss,
            "PresignGetObject",
            &format!("{bucket}/{key}"),
            client.presign_get(bucket, key, ttl),
        )
        .await
    }
}
