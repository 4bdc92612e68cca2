/*!
Host protocol boundary.

The backup orchestrator drives each adapter through a fixed sequence: one
`init` call with the flat configuration map, then any number of capability
calls. The traits here express that boundary; [`PluginContext`] carries the
process-level collaborators every adapter is initialized with.
*/

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Environment;
use crate::credentials::CredentialResolver;
use crate::metadata::{EcsMetadataClient, MetadataCache, MetadataResolver, MetadataService};
use crate::token::TokenRefresher;
use crate::zone::{ClusterProfileSource, MountedClusterProfile};
use crate::Result;

/// Overrides where the cluster profile ConfigMap is mounted
pub const ENV_CLUSTER_PROFILE_DIR: &str = "ALIBACKUP_CLUSTER_PROFILE_DIR";

/// Collaborators shared by the adapters of one plugin process
#[derive(Clone)]
pub struct PluginContext {
    env: Environment,
    metadata: MetadataResolver,
    cluster_profile: Arc<dyn ClusterProfileSource>,
}

impl PluginContext {
    /// Context over an explicit environment and metadata service, with a
    /// fresh region/zone cache
    pub fn new(env: Environment, metadata: Arc<dyn MetadataService>) -> Self {
        let cluster_profile: Arc<dyn ClusterProfileSource> = Arc::new(
            env.get(ENV_CLUSTER_PROFILE_DIR)
                .map(MountedClusterProfile::new)
                .unwrap_or_default(),
        );
        Self {
            env,
            metadata: MetadataResolver::new(metadata, Arc::new(MetadataCache::new())),
            cluster_profile,
        }
    }

    /// Context for the running process: its environment and the ECS
    /// instance-metadata service
    pub fn from_process() -> Result<Self> {
        let env = Environment::from_process();
        let metadata = EcsMetadataClient::from_env(&env)?;
        Ok(Self::new(env, Arc::new(metadata)))
    }

    /// Replace the cluster profile source
    pub fn with_cluster_profile(mut self, source: Arc<dyn ClusterProfileSource>) -> Self {
        self.cluster_profile = source;
        self
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn metadata(&self) -> &MetadataResolver {
        &self.metadata
    }

    pub fn cluster_profile(&self) -> &dyn ClusterProfileSource {
        self.cluster_profile.as_ref()
    }

    /// Credential resolver backed by this context's metadata service
    pub fn credential_resolver(&self) -> CredentialResolver {
        CredentialResolver::new(TokenRefresher::new(Arc::clone(self.metadata.service())))
    }
}

/// Object storage extension point
#[async_trait]
pub trait ObjectStorePlugin: Send + Sync {
    async fn init(&mut self, config: &HashMap<String, String>) -> Result<()>;

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes>;

    async fn list_common_prefixes(&self, bucket: &str, prefix: &str, delimiter: &str) -> Result<Vec<String>>;

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    async fn create_signed_url(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String>;
}

/// Block volume snapshot extension point
#[async_trait]
pub trait VolumeSnapshotterPlugin: Send + Sync {
    async fn init(&mut self, config: &HashMap<String, String>) -> Result<()>;

    async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        volume_type: &str,
        volume_zone: &str,
        iops: Option<i64>,
    ) -> Result<String>;

    /// Volume category and provisioned IOPS
    async fn get_volume_info(&self, volume_id: &str, volume_zone: &str) -> Result<(String, Option<i64>)>;

    async fn create_snapshot(
        &self,
        volume_id: &str,
        volume_zone: &str,
        tags: &HashMap<String, String>,
    ) -> Result<String>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Provider volume identifier embedded in a persistent volume manifest
    fn get_volume_id(&self, pv: &Value) -> Result<String>;

    fn set_volume_id(&self, pv: &Value, volume_id: &str) -> Result<Value>;
}

/// Restore-time manifest mutation extension point
#[async_trait]
pub trait RestoreItemAction: Send + Sync {
    /// Resource kinds the action wants to see
    fn applies_to(&self) -> Vec<String>;

    async fn execute(&self, item: Value) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MockMetadataService;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cluster_profile_dir_from_environment() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("vsw-zone"), "vsw-a:cn-beijing-k").unwrap();

        let env = Environment::from_pairs([(ENV_CLUSTER_PROFILE_DIR, dir.path().to_string_lossy().into_owned())]);
        let context = PluginContext::new(env, Arc::new(MockMetadataService::new()));

        let data = context.cluster_profile().load().await.unwrap().unwrap();
        assert_eq!(data.get("vsw-zone").map(String::as_str), Some("vsw-a:cn-beijing-k"));
    }

    #[tokio::test]
    async fn test_contexts_do_not_share_metadata_cache() {
        let mut first = MockMetadataService::new();
        first.expect_region_id().returning(|| Ok("cn-beijing".to_string()));
        let mut second = MockMetadataService::new();
        second.expect_region_id().returning(|| Ok("cn-shanghai".to_string()));

        let a = PluginContext::new(Environment::default(), Arc::new(first));
        let b = PluginContext::new(Environment::default(), Arc::new(second));

        assert_eq!(a.metadata().region_or(None, "x").await, "cn-beijing");
        assert_eq!(b.metadata().region_or(None, "x").await, "cn-shanghai");
    }
}
