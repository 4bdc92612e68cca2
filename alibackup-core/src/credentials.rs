/*!
Credential resolution.

Credentials come from one of two places: long-lived access keys found in the
environment (optionally topped up from a dotenv-style credentials file), or a
RAM role exchanged for short-lived STS credentials. The resolver applies the
precedence rules once at adapter initialization; afterwards a role-based set
is refreshed by [`crate::client::RefreshingClient`] before each call.
*/

use std::fmt;
use std::path::Path;
use tracing::{debug, info};

use crate::config::{
    Environment, PluginConfig, ENV_ACCESS_KEY_ID, ENV_ACCESS_KEY_SECRET, ENV_RAM_ROLE,
    ENV_STS_TOKEN,
};
use crate::metadata::RoleCredentials;
use crate::token::TokenRefresher;
use crate::{PluginError, Result};

/// Immutable snapshot of the credentials a client is built from.
///
/// A set is either static (no role name, never refreshed) or role-based (the
/// keys and session token are ephemeral and are replaced wholesale by the next
/// exchange).
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    access_key_id: String,
    access_key_secret: String,
    session_token: Option<String>,
    role_name: Option<String>,
}

impl CredentialSet {
    /// Long-lived access keys, optionally with a session token supplied alongside
    pub fn static_keys(
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
            session_token: session_token.filter(|t| !t.is_empty()),
            role_name: None,
        }
    }

    /// Ephemeral keys obtained for `role`
    pub fn from_role(role: impl Into<String>, credentials: RoleCredentials) -> Self {
        Self {
            access_key_id: credentials.access_key_id,
            access_key_secret: credentials.access_key_secret,
            session_token: Some(credentials.security_token).filter(|t| !t.is_empty()),
            role_name: Some(role.into()),
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn access_key_secret(&self) -> &str {
        &self.access_key_secret
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn role_name(&self) -> Option<&str> {
        self.role_name.as_deref()
    }

    /// Whether the keys must be refreshed before use
    pub fn is_role_based(&self) -> bool {
        self.role_name.is_some()
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("role_name", &self.role_name)
            .finish()
    }
}

/// Parse a dotenv-style credentials file into name/value pairs.
///
/// The process environment is left untouched; callers overlay the returned
/// pairs onto an [`Environment`] snapshot.
///
/// # Errors
/// Returns [`PluginError::CredentialsFile`] naming `path` when the file cannot
/// be opened or a line cannot be parsed.
pub fn load_credentials_file(path: &Path) -> Result<Vec<(String, String)>> {
    let to_error = |reason: String| PluginError::CredentialsFile {
        path: path.to_path_buf(),
        reason,
    };

    let iter = dotenv_flow::from_path_iter(path).map_err(|e| to_error(e.to_string()))?;
    let mut pairs = Vec::new();
    for item in iter {
        pairs.push(item.map_err(|e| to_error(e.to_string()))?);
    }

    debug!(path = %path.display(), entries = pairs.len(), "Loaded credentials file");
    Ok(pairs)
}

/// Applies the credential precedence rules
#[derive(Clone)]
pub struct CredentialResolver {
    refresher: TokenRefresher,
}

impl CredentialResolver {
    pub fn new(refresher: TokenRefresher) -> Self {
        Self { refresher }
    }

    /// Token refresher used for role exchanges
    pub fn refresher(&self) -> &TokenRefresher {
        &self.refresher
    }

    /// Produce the credential set for an adapter.
    ///
    /// # Arguments
    /// * `config` - Parsed plugin configuration (credentials file location)
    /// * `env` - Environment snapshot the keys and role name are read from
    /// * `managed` - Whether instance-metadata role discovery is expected to work
    ///
    /// # Errors
    /// Returns an error if:
    /// - The credentials file cannot be read
    /// - No access keys and no role are available outside a managed environment
    /// - Role discovery or the role exchange fails
    pub async fn resolve(
        &self,
        config: &PluginConfig,
        env: &Environment,
        managed: bool,
    ) -> Result<CredentialSet> {
        let env = match config.credentials_file_path(env) {
            Some(path) => env.overlay(load_credentials_file(&path)?),
            None => env.clone(),
        };

        if let (Some(id), Some(secret)) = (env.get(ENV_ACCESS_KEY_ID), env.get(ENV_ACCESS_KEY_SECRET)) {
            info!(access_key_id = %id, "Using static access keys");
            return Ok(CredentialSet::static_keys(
                id,
                secret,
                env.get(ENV_STS_TOKEN).map(str::to_string),
            ));
        }

        let role = match env.get(ENV_RAM_ROLE) {
            Some(role) => role.to_string(),
            None if !managed => {
                return Err(PluginError::config(format!(
                    "{ENV_ACCESS_KEY_ID} or {ENV_ACCESS_KEY_SECRET} environment variable is not set"
                )));
            }
            None => self.refresher.discover_role().await?,
        };

        info!(role = %role, "Using RAM role credentials");
        self.refresher.exchange(&role).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MockMetadataService;
    use chrono::Utc;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn sts(role: &str) -> RoleCredentials {
        RoleCredentials {
            access_key_id: format!("STS.{role}"),
            access_key_secret: "sts-secret".to_string(),
            security_token: "sts-token".to_string(),
            expiration: Utc::now(),
            last_updated: None,
            code: String::new(),
        }
    }

    fn resolver(mock: MockMetadataService) -> CredentialResolver {
        CredentialResolver::new(TokenRefresher::new(Arc::new(mock)))
    }

    fn untouched() -> MockMetadataService {
        let mut mock = MockMetadataService::new();
        mock.expect_role_name().times(0);
        mock.expect_role_credentials().times(0);
        mock
    }

    #[tokio::test]
    async fn test_static_keys_win_over_role() {
        let env = Environment::from_pairs([
            (ENV_ACCESS_KEY_ID, "ak"),
            (ENV_ACCESS_KEY_SECRET, "sk"),
            (ENV_RAM_ROLE, "IgnoredRole"),
        ]);

        for managed in [true, false] {
            let creds = resolver(untouched())
                .resolve(&PluginConfig::default(), &env, managed)
                .await
                .unwrap();
            assert_eq!(creds.access_key_id(), "ak");
            assert_eq!(creds.access_key_secret(), "sk");
            assert_eq!(creds.role_name(), None);
            assert!(!creds.is_role_based());
        }
    }

    #[tokio::test]
    async fn test_static_keys_keep_session_token() {
        let env = Environment::from_pairs([
            (ENV_ACCESS_KEY_ID, "ak"),
            (ENV_ACCESS_KEY_SECRET, "sk"),
            (ENV_STS_TOKEN, "tok"),
        ]);
        let creds = resolver(untouched())
            .resolve(&PluginConfig::default(), &env, false)
            .await
            .unwrap();
        assert_eq!(creds.session_token(), Some("tok"));
    }

    #[tokio::test]
    async fn test_missing_keys_outside_managed_environment() {
        let env = Environment::from_pairs([(ENV_ACCESS_KEY_ID, "ak")]);
        let err = resolver(untouched())
            .resolve(&PluginConfig::default(), &env, false)
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::Config(_)));
        let msg = err.to_string();
        assert!(msg.contains(ENV_ACCESS_KEY_ID));
        assert!(msg.contains(ENV_ACCESS_KEY_SECRET));
    }

    #[tokio::test]
    async fn test_managed_environment_discovers_role() {
        let mut mock = MockMetadataService::new();
        mock.expect_role_name()
            .times(1)
            .returning(|| Ok("NodeRole".to_string()));
        mock.expect_role_credentials()
            .withf(|role| role == "NodeRole")
            .times(1)
            .returning(|role| Ok(sts(role)));

        let creds = resolver(mock)
            .resolve(&PluginConfig::default(), &Environment::default(), true)
            .await
            .unwrap();
        assert_eq!(creds.role_name(), Some("NodeRole"));
        assert_eq!(creds.access_key_id(), "STS.NodeRole");
    }

    #[tokio::test]
    async fn test_explicit_role_skips_discovery() {
        let mut mock = MockMetadataService::new();
        mock.expect_role_name().times(0);
        mock.expect_role_credentials()
            .withf(|role| role == "CustomRole")
            .times(1)
            .returning(|role| Ok(sts(role)));

        let env = Environment::from_pairs([(ENV_RAM_ROLE, "CustomRole")]);
        let creds = resolver(mock)
            .resolve(&PluginConfig::default(), &env, false)
            .await
            .unwrap();
        assert_eq!(creds.role_name(), Some("CustomRole"));
    }

    #[tokio::test]
    async fn test_exchange_failure_is_fatal() {
        let mut mock = MockMetadataService::new();
        mock.expect_role_credentials()
            .returning(|_| Err(PluginError::metadata("404")));

        let env = Environment::from_pairs([(ENV_RAM_ROLE, "CustomRole")]);
        let err = resolver(mock)
            .resolve(&PluginConfig::default(), &env, true)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::TokenExchange { .. }));
    }

    #[tokio::test]
    async fn test_credentials_file_overrides_environment() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{ENV_ACCESS_KEY_ID}=file-ak").unwrap();
        writeln!(file, "{ENV_ACCESS_KEY_SECRET}=file-sk").unwrap();

        let env = Environment::from_pairs([
            (ENV_ACCESS_KEY_ID, "env-ak"),
            (ENV_ACCESS_KEY_SECRET, "env-sk"),
        ]);
        let config = PluginConfig {
            credentials_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let creds = resolver(untouched()).resolve(&config, &env, false).await.unwrap();
        assert_eq!(creds.access_key_id(), "file-ak");
        assert_eq!(creds.access_key_secret(), "file-sk");
        assert_eq!(env.get(ENV_ACCESS_KEY_ID), Some("env-ak"));
    }

    #[tokio::test]
    async fn test_missing_credentials_file_names_path() {
        let config = PluginConfig {
            credentials_file: Some(PathBuf::from("/nonexistent/alibackup/credentials")),
            ..Default::default()
        };

        let err = resolver(untouched())
            .resolve(&config, &Environment::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::CredentialsFile { .. }));
        assert!(err.to_string().contains("/nonexistent/alibackup/credentials"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = CredentialSet::static_keys("ak", "super-secret", Some("tok".to_string()));
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("ak"));
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("\"tok\""));
    }
}
