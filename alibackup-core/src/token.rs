/*!
Exchange of a RAM role name for short-lived STS credentials.
*/

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::credentials::CredentialSet;
use crate::metadata::MetadataService;
use crate::{PluginError, Result};

/// Upper bound on a single role exchange against the local metadata endpoint.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Turns a role name into a role-based [`CredentialSet`]
///
/// Nothing is cached: every call performs a live exchange, so credentials are
/// only as old as the call that requested them.
#[derive(Clone)]
pub struct TokenRefresher {
    metadata: Arc<dyn MetadataService>,
    timeout: Duration,
}

impl TokenRefresher {
    pub fn new(metadata: Arc<dyn MetadataService>) -> Self {
        Self::with_timeout(metadata, DEFAULT_EXCHANGE_TIMEOUT)
    }

    pub fn with_timeout(metadata: Arc<dyn MetadataService>, timeout: Duration) -> Self {
        Self { metadata, timeout }
    }

    /// Exchange `role` for fresh STS credentials.
    ///
    /// # Errors
    /// Returns [`PluginError::TokenExchange`] when the metadata service fails
    /// or does not answer within the exchange timeout.
    pub async fn exchange(&self, role: &str) -> Result<CredentialSet> {
        debug!(role = %role, "Exchanging RAM role for STS credentials");

        let exchanged = tokio::time::timeout(self.timeout, self.metadata.role_credentials(role))
            .await
            .map_err(|_| PluginError::TokenExchange {
                role: role.to_string(),
                message: format!("timed out after {:?}", self.timeout),
            })?
            .map_err(|e| PluginError::TokenExchange {
                role: role.to_string(),
                message: e.to_string(),
            })?;

        Ok(CredentialSet::from_role(role, exchanged))
    }

    /// Discover the RAM role attached to the instance, bounded by the same timeout.
    pub async fn discover_role(&self) -> Result<String> {
        tokio::time::timeout(self.timeout, self.metadata.role_name())
            .await
            .map_err(|_| {
                PluginError::metadata(format!(
                    "timed out after {:?} discovering the instance RAM role",
                    self.timeout
                ))
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MockMetadataService, RoleCredentials};
    use chrono::Utc;

    fn role_credentials(suffix: &str) -> RoleCredentials {
        RoleCredentials {
            access_key_id: format!("STS.ak-{suffix}"),
            access_key_secret: format!("sk-{suffix}"),
            security_token: format!("token-{suffix}"),
            expiration: Utc::now(),
            last_updated: None,
            code: "Success".to_string(),
        }
    }

    #[tokio::test]
    async fn test_exchange_builds_role_based_set() {
        let mut mock = MockMetadataService::new();
        mock.expect_role_credentials()
            .withf(|role| role == "VeleroRole")
            .times(1)
            .returning(|_| Ok(role_credentials("1")));

        let refresher = TokenRefresher::new(Arc::new(mock));
        let creds = refresher.exchange("VeleroRole").await.unwrap();

        assert!(creds.is_role_based());
        assert_eq!(creds.role_name(), Some("VeleroRole"));
        assert_eq!(creds.access_key_id(), "STS.ak-1");
        assert_eq!(creds.session_token(), Some("token-1"));
    }

    #[tokio::test]
    async fn test_every_exchange_is_live() {
        let mut mock = MockMetadataService::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_role_credentials()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(role_credentials("1")));
        mock.expect_role_credentials()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(role_credentials("2")));

        let refresher = TokenRefresher::new(Arc::new(mock));
        let first = refresher.exchange("r").await.unwrap();
        let second = refresher.exchange("r").await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_failure_names_role() {
        let mut mock = MockMetadataService::new();
        mock.expect_role_credentials()
            .returning(|_| Err(PluginError::metadata("connection refused")));

        let refresher = TokenRefresher::new(Arc::new(mock));
        let err = refresher.exchange("VeleroRole").await.unwrap_err();

        assert!(matches!(err, PluginError::TokenExchange { ref role, .. } if role == "VeleroRole"));
        assert!(err.to_string().contains("connection refused"));
    }

    struct HangingMetadata;

    #[async_trait::async_trait]
    impl MetadataService for HangingMetadata {
        async fn region_id(&self) -> Result<String> {
            std::future::pending().await
        }
        async fn zone_id(&self) -> Result<String> {
            std::future::pending().await
        }
        async fn role_name(&self) -> Result<String> {
            std::future::pending().await
        }
        async fn role_credentials(&self, _role_name: &str) -> Result<RoleCredentials> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_times_out() {
        let refresher = TokenRefresher::new(Arc::new(HangingMetadata));

        let err = refresher.exchange("VeleroRole").await.unwrap_err();
        assert!(matches!(err, PluginError::TokenExchange { .. }));
        assert!(err.to_string().contains("timed out"));

        let err = refresher.discover_role().await.unwrap_err();
        assert!(matches!(err, PluginError::Metadata(_)));
    }
}
