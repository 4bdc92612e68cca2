/*!
Region and zone discovery from the ECS instance-metadata service.

The [`MetadataService`] trait is the port; [`EcsMetadataClient`] is the HTTP
adapter. [`MetadataResolver`] layers explicit configuration over the service
and remembers the first successful answer in a [`MetadataCache`].
*/

pub mod client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{error, info};

use crate::Result;

pub use client::{EcsMetadataClient, MetadataClientOptions};

/// Short-lived credentials issued for an instance RAM role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCredentials {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub security_token: String,
    pub expiration: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
    pub code: String,
}

/// Instance-metadata capabilities the plugin relies on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Region the instance runs in
    async fn region_id(&self) -> Result<String>;

    /// Availability zone the instance runs in
    async fn zone_id(&self) -> Result<String>;

    /// Name of the RAM role attached to the instance
    async fn role_name(&self) -> Result<String>;

    /// Exchange a RAM role name for STS credentials
    async fn role_credentials(&self, role_name: &str) -> Result<RoleCredentials>;
}

/// Which location field to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    Region,
    Zone,
}

impl MetadataField {
    fn as_str(self) -> &'static str {
        match self {
            MetadataField::Region => "region",
            MetadataField::Zone => "zone",
        }
    }
}

/// Region and zone values learned from instance metadata.
///
/// Each slot is written at most once; concurrent first writers race and the
/// loser's value is discarded. An instance does not change region or zone for
/// the lifetime of the process, so cached values are never invalidated.
#[derive(Debug, Default)]
pub struct MetadataCache {
    region: OnceCell<String>,
    zone: OnceCell<String>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, field: MetadataField) -> &OnceCell<String> {
        match field {
            MetadataField::Region => &self.region,
            MetadataField::Zone => &self.zone,
        }
    }

    /// Cached value for `field`, if any
    pub fn get(&self, field: MetadataField) -> Option<&str> {
        self.slot(field).get().map(String::as_str)
    }

    /// Store `value` unless a value is already present; returns the winner.
    pub fn set(&self, field: MetadataField, value: String) -> &str {
        let slot = self.slot(field);
        let _ = slot.set(value);
        slot.get().map(String::as_str).unwrap_or_default()
    }
}

/// Resolves region and zone from explicit values or instance metadata
#[derive(Clone)]
pub struct MetadataResolver {
    service: Arc<dyn MetadataService>,
    cache: Arc<MetadataCache>,
}

impl MetadataResolver {
    pub fn new(service: Arc<dyn MetadataService>, cache: Arc<MetadataCache>) -> Self {
        Self { service, cache }
    }

    /// Underlying metadata service
    pub fn service(&self) -> &Arc<dyn MetadataService> {
        &self.service
    }

    /// Resolve `field`, preferring a non-empty `explicit` value.
    ///
    /// Never fails: a metadata error is logged and yields an empty string so
    /// callers can substitute their own default.
    pub async fn resolve(&self, field: MetadataField, explicit: Option<&str>) -> String {
        if let Some(value) = explicit.map(str::trim).filter(|v| !v.is_empty()) {
            return value.to_string();
        }

        if let Some(cached) = self.cache.get(field) {
            return cached.to_string();
        }

        let queried = match field {
            MetadataField::Region => self.service.region_id().await,
            MetadataField::Zone => self.service.zone_id().await,
        };

        match queried {
            Ok(value) if !value.is_empty() => {
                let value = self.cache.set(field, value).to_string();
                info!(field = field.as_str(), value = %value, "Resolved from instance metadata");
                value
            }
            Ok(_) => {
                error!(field = field.as_str(), "Instance metadata returned an empty value");
                String::new()
            }
            Err(e) => {
                error!(field = field.as_str(), error = %e, "Failed to query instance metadata");
                String::new()
            }
        }
    }

    /// Resolve the region, falling back to `default` when nothing is found
    pub async fn region_or(&self, explicit: Option<&str>, default: &str) -> String {
        let region = self.resolve(MetadataField::Region, explicit).await;
        if region.is_empty() {
            default.to_string()
        } else {
            region
        }
    }

    /// Resolve the zone; empty when unknown
    pub async fn zone(&self, explicit: Option<&str>) -> String {
        self.resolve(MetadataField::Zone, explicit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PluginError;

    fn resolver(mock: MockMetadataService) -> MetadataResolver {
        MetadataResolver::new(Arc::new(mock), Arc::new(MetadataCache::new()))
    }

    #[tokio::test]
    async fn test_explicit_value_skips_metadata() {
        let mut mock = MockMetadataService::new();
        mock.expect_region_id().times(0);

        let resolver = resolver(mock);
        let region = resolver.resolve(MetadataField::Region, Some("cn-shanghai")).await;
        assert_eq!(region, "cn-shanghai");
    }

    #[tokio::test]
    async fn test_first_success_is_cached() {
        let mut mock = MockMetadataService::new();
        mock.expect_zone_id()
            .times(1)
            .returning(|| Ok("cn-beijing-k".to_string()));

        let resolver = resolver(mock);
        assert_eq!(resolver.zone(None).await, "cn-beijing-k");
        assert_eq!(resolver.zone(Some("")).await, "cn-beijing-k");
    }

    #[tokio::test]
    async fn test_failure_yields_empty_and_is_not_cached() {
        let mut mock = MockMetadataService::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_region_id()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(PluginError::metadata("connection refused")));
        mock.expect_region_id()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok("cn-beijing".to_string()));

        let resolver = resolver(mock);
        assert_eq!(resolver.resolve(MetadataField::Region, None).await, "");
        assert_eq!(resolver.resolve(MetadataField::Region, None).await, "cn-beijing");
    }

    #[tokio::test]
    async fn test_region_default_substitution() {
        let mut mock = MockMetadataService::new();
        mock.expect_region_id()
            .returning(|| Err(PluginError::metadata("unreachable")));

        let resolver = resolver(mock);
        assert_eq!(resolver.region_or(None, "cn-hangzhou").await, "cn-hangzhou");
    }

    #[test]
    fn test_cache_first_writer_wins() {
        let cache = MetadataCache::new();
        assert_eq!(cache.set(MetadataField::Zone, "cn-beijing-l".to_string()), "cn-beijing-l");
        assert_eq!(cache.set(MetadataField::Zone, "cn-beijing-k".to_string()), "cn-beijing-l");
        assert_eq!(cache.get(MetadataField::Region), None);
    }

    #[test]
    fn test_cache_concurrent_first_write() {
        let cache = Arc::new(MetadataCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.set(MetadataField::Region, format!("region-{i}")).to_string())
            })
            .collect();

        let winners: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let stored = cache.get(MetadataField::Region).unwrap().to_string();
        assert!(winners.iter().all(|w| *w == stored));
    }
}
