/*!
Client factory and credential-aware client bindings.

A [`ClientBuilder`] turns a [`CredentialSet`] plus addressing into a concrete
OSS or ECS client. [`RefreshingClient`] owns the live [`ClientBinding`] for an
adapter and, for role-based credentials, replaces it with a freshly built one
before every call.
*/

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{NetworkType, DEFAULT_REGION};
use crate::credentials::CredentialSet;
use crate::token::TokenRefresher;
use crate::{PluginError, Result};

/// OSS endpoint for the given addressing inputs.
///
/// An explicit endpoint always wins. The accelerate endpoint is global; the
/// internal and public endpoints embed the region, which falls back to
/// [`DEFAULT_REGION`] when empty.
pub fn oss_endpoint(explicit: Option<&str>, region: &str, network: NetworkType) -> String {
    if let Some(endpoint) = explicit.map(str::trim).filter(|e| !e.is_empty()) {
        return endpoint.to_string();
    }

    let region = if region.is_empty() { DEFAULT_REGION } else { region };
    match network {
        NetworkType::Internal => format!("https://oss-{region}-internal.aliyuncs.com"),
        NetworkType::Accelerate => "https://oss-accelerate.aliyuncs.com".to_string(),
        NetworkType::Public => format!("https://oss-{region}.aliyuncs.com"),
    }
}

/// Regional ECS API endpoint
pub fn ecs_endpoint(region: &str) -> String {
    let region = if region.is_empty() { DEFAULT_REGION } else { region };
    format!("https://ecs.{region}.aliyuncs.com")
}

/// Builds a provider client from credentials and addressing
pub trait ClientBuilder: Send + Sync {
    /// Capability surface the built client exposes
    type Client: ?Sized + Send + Sync;

    /// Construct a client. At least one of `endpoint` and `region` is present.
    fn build(
        &self,
        credentials: &CredentialSet,
        endpoint: Option<&str>,
        region: Option<&str>,
    ) -> Result<Arc<Self::Client>>;
}

/// Live client plus the inputs it was built from
pub struct ClientBinding<C: ?Sized> {
    pub client: Arc<C>,
    pub credentials: CredentialSet,
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

impl<C: ?Sized + Send + Sync> ClientBinding<C> {
    /// Validate the addressing inputs and build a binding through `builder`.
    ///
    /// # Errors
    /// Returns a configuration error when neither endpoint nor region is set,
    /// and propagates builder failures.
    pub fn build<B>(
        builder: &B,
        credentials: CredentialSet,
        endpoint: Option<&str>,
        region: Option<&str>,
    ) -> Result<Self>
    where
        B: ClientBuilder<Client = C> + ?Sized,
    {
        let endpoint = endpoint.filter(|e| !e.is_empty());
        let region = region.filter(|r| !r.is_empty());
        if endpoint.is_none() && region.is_none() {
            return Err(PluginError::config("either endpoint or region must be specified"));
        }

        let client = builder.build(&credentials, endpoint, region)?;
        Ok(Self {
            client,
            credentials,
            endpoint: endpoint.map(str::to_string),
            region: region.map(str::to_string),
        })
    }
}

/// Adapter-owned client that follows role-based credential rotation.
///
/// The check-role, exchange, rebuild and swap sequence runs under a single
/// async mutex, so concurrent callers never build two clients at once. Callers
/// receive an `Arc` to the client that was current when they asked; a call
/// already in flight keeps its client even after a later swap.
pub struct RefreshingClient<C: ?Sized + Send + Sync> {
    builder: Arc<dyn ClientBuilder<Client = C>>,
    refresher: TokenRefresher,
    binding: Mutex<Arc<ClientBinding<C>>>,
}

impl<C: ?Sized + Send + Sync> RefreshingClient<C> {
    /// Build the initial binding from resolved credentials
    pub fn new(
        builder: Arc<dyn ClientBuilder<Client = C>>,
        refresher: TokenRefresher,
        credentials: CredentialSet,
        endpoint: Option<&str>,
        region: Option<&str>,
    ) -> Result<Self> {
        let binding = ClientBinding::build(builder.as_ref(), credentials, endpoint, region)?;
        Ok(Self {
            builder,
            refresher,
            binding: Mutex::new(Arc::new(binding)),
        })
    }

    /// Client to use for the next call, refreshed first when role-based
    ///
    /// # Errors
    /// Propagates token exchange and client construction failures; the
    /// previous binding stays in place when a refresh fails.
    pub async fn current(&self) -> Result<Arc<C>> {
        let mut guard = self.binding.lock().await;

        if let Some(role) = guard.credentials.role_name() {
            debug!(role = %role, "Refreshing client credentials");
            let fresh = self.refresher.exchange(role).await?;
            let rebuilt = ClientBinding::build(
                self.builder.as_ref(),
                fresh,
                guard.endpoint.as_deref(),
                guard.region.as_deref(),
            )?;
            *guard = Arc::new(rebuilt);
        }

        Ok(Arc::clone(&guard.client))
    }

    /// Snapshot of the binding currently installed
    pub async fn binding(&self) -> Arc<ClientBinding<C>> {
        Arc::clone(&*self.binding.lock().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MockMetadataService, RoleCredentials};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Built {
        access_key_id: String,
        session_token: Option<String>,
    }

    #[derive(Default)]
    struct CountingBuilder {
        builds: AtomicUsize,
    }

    impl ClientBuilder for CountingBuilder {
        type Client = Built;

        fn build(
            &self,
            credentials: &CredentialSet,
            _endpoint: Option<&str>,
            _region: Option<&str>,
        ) -> Result<Arc<Built>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Built {
                access_key_id: credentials.access_key_id().to_string(),
                session_token: credentials.session_token().map(str::to_string),
            }))
        }
    }

    fn role_credentials(n: usize) -> RoleCredentials {
        RoleCredentials {
            access_key_id: format!("STS.{n}"),
            access_key_secret: "sk".to_string(),
            security_token: format!("token-{n}"),
            expiration: Utc::now(),
            last_updated: None,
            code: String::new(),
        }
    }

    fn refresher(mock: MockMetadataService) -> TokenRefresher {
        TokenRefresher::new(Arc::new(mock))
    }

    #[test]
    fn test_oss_endpoint_derivation() {
        assert_eq!(
            oss_endpoint(Some("https://custom.example.com"), "cn-beijing", NetworkType::Internal),
            "https://custom.example.com"
        );
        assert_eq!(
            oss_endpoint(None, "cn-beijing", NetworkType::Internal),
            "https://oss-cn-beijing-internal.aliyuncs.com"
        );
        assert_eq!(
            oss_endpoint(None, "cn-beijing", NetworkType::Public),
            "https://oss-cn-beijing.aliyuncs.com"
        );
        assert_eq!(
            oss_endpoint(None, "cn-beijing", NetworkType::Accelerate),
            oss_endpoint(None, "ap-southeast-1", NetworkType::Accelerate)
        );
        assert_eq!(
            oss_endpoint(Some(""), "", NetworkType::Public),
            "https://oss-cn-hangzhou.aliyuncs.com"
        );
    }

    #[test]
    fn test_ecs_endpoint() {
        assert_eq!(ecs_endpoint("cn-beijing"), "https://ecs.cn-beijing.aliyuncs.com");
        assert_eq!(ecs_endpoint(""), "https://ecs.cn-hangzhou.aliyuncs.com");
    }

    #[test]
    fn test_binding_requires_endpoint_or_region() {
        let builder = CountingBuilder::default();
        let creds = CredentialSet::static_keys("ak", "sk", None);

        let Err(err) = ClientBinding::build(&builder, creds.clone(), None, Some("")) else {
            panic!("binding without endpoint or region must fail");
        };
        assert!(matches!(err, PluginError::Config(_)));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 0);

        let binding = ClientBinding::build(&builder, creds, Some("https://e"), None).unwrap();
        assert_eq!(binding.endpoint.as_deref(), Some("https://e"));
        assert!(binding.region.is_none());
    }

    #[tokio::test]
    async fn test_static_credentials_never_refresh() {
        let mut mock = MockMetadataService::new();
        mock.expect_role_credentials().times(0);

        let builder = Arc::new(CountingBuilder::default());
        let client = RefreshingClient::<Built>::new(
            builder.clone(),
            refresher(mock),
            CredentialSet::static_keys("ak", "sk", None),
            None,
            Some("cn-beijing"),
        )
        .unwrap();

        let first = client.current().await.unwrap();
        let second = client.current().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_role_credentials_swap_client_each_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut mock = MockMetadataService::new();
        mock.expect_role_credentials()
            .returning(move |_| Ok(role_credentials(counter.fetch_add(1, Ordering::SeqCst) + 1)));

        let builder = Arc::new(CountingBuilder::default());
        let initial = CredentialSet::from_role("VeleroRole", role_credentials(0));
        let client = RefreshingClient::<Built>::new(
            builder.clone(),
            refresher(mock),
            initial,
            Some("https://oss-cn-beijing.aliyuncs.com"),
            Some("cn-beijing"),
        )
        .unwrap();

        let first = client.current().await.unwrap();
        let second = client.current().await.unwrap();

        assert_eq!(first.access_key_id, "STS.1");
        assert_eq!(second.access_key_id, "STS.2");
        assert_eq!(second.session_token.as_deref(), Some("token-2"));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 3);

        let binding = client.binding().await;
        assert_eq!(binding.credentials.role_name(), Some("VeleroRole"));
        assert_eq!(binding.region.as_deref(), Some("cn-beijing"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_binding() {
        let mut mock = MockMetadataService::new();
        mock.expect_role_credentials()
            .returning(|_| Err(crate::PluginError::metadata("unreachable")));

        let client = RefreshingClient::<Built>::new(
            Arc::new(CountingBuilder::default()),
            refresher(mock),
            CredentialSet::from_role("VeleroRole", role_credentials(0)),
            None,
            Some("cn-beijing"),
        )
        .unwrap();

        assert!(client.current().await.is_err());
        assert_eq!(client.binding().await.client.access_key_id, "STS.0");
    }
}
