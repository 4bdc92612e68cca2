/*!
HTTP client for the ECS instance-metadata service.

Supports the IMDSv2 session-token handshake with IMDSv1 fallback, per-request
timeouts and bounded retries.
*/

use alibackup_retry::{classify, with_backoff, RetryPolicy, RetryableError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use super::{MetadataService, RoleCredentials};
use crate::config::Environment;
use crate::observability::{MetricsTimer, Provider};
use crate::{PluginError, Result};

pub const DEFAULT_ENDPOINT: &str = "http://100.100.100.200";
pub const ENV_IMDS_ENDPOINT: &str = "ALIBABA_CLOUD_IMDS_ENDPOINT";
pub const ENV_IMDSV2_DISABLED: &str = "ALIBABA_CLOUD_IMDSV2_DISABLED";
pub const ENV_IMDS_ROLE_NAME: &str = "ALIBABA_CLOUD_ECS_METADATA";

const TOKEN_PATH: &str = "/latest/api/token";
const TOKEN_TTL_HEADER: &str = "X-aliyun-ecs-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aliyun-ecs-metadata-token";
const REGION_PATH: &str = "/latest/meta-data/region-id";
const ZONE_PATH: &str = "/latest/meta-data/zone-id";
const ROLE_PATH: &str = "/latest/meta-data/ram/security-credentials/";

const DEFAULT_TOKEN_TTL_SECONDS: u32 = 18_000;
const MAX_TOKEN_TTL_SECONDS: u32 = 21_600;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for [`EcsMetadataClient`]
#[derive(Debug, Clone)]
pub struct MetadataClientOptions {
    pub endpoint: String,
    /// Pins the RAM role instead of discovering it
    pub role_name: Option<String>,
    pub disable_imdsv2: bool,
    pub token_ttl_seconds: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for MetadataClientOptions {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            role_name: None,
            disable_imdsv2: false,
            token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl MetadataClientOptions {
    /// Defaults adjusted by the `ALIBABA_CLOUD_IMDS*` environment variables
    pub fn from_env(env: &Environment) -> Self {
        let mut options = Self::default();
        if let Some(endpoint) = env.get(ENV_IMDS_ENDPOINT) {
            options.endpoint = endpoint.to_string();
        }
        if let Some(disabled) = env.get(ENV_IMDSV2_DISABLED) {
            options.disable_imdsv2 = matches!(disabled.to_ascii_lowercase().as_str(), "1" | "true");
        }
        options.role_name = env.get(ENV_IMDS_ROLE_NAME).map(str::to_string);
        options
    }
}

/// Failure of a single metadata HTTP exchange
#[derive(Debug)]
struct MetadataHttpError {
    url: String,
    status: Option<u16>,
    message: String,
}

impl fmt::Display for MetadataHttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} returned status {status}: {}", self.url, self.message),
            None => write!(f, "{}: {}", self.url, self.message),
        }
    }
}

impl std::error::Error for MetadataHttpError {}

impl RetryableError for MetadataHttpError {
    fn is_transient(&self) -> bool {
        !matches!(self.status, Some(400) | Some(404))
    }
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct Inner {
    http: reqwest::Client,
    endpoint: String,
    disable_imdsv2: bool,
    token_ttl_seconds: u32,
    token: Mutex<Option<CachedToken>>,
}

impl Inner {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn session_token(&self) -> std::result::Result<Option<String>, MetadataHttpError> {
        if self.disable_imdsv2 {
            return Ok(None);
        }

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(Some(token.value.clone()));
            }
        }

        let request = self
            .http
            .put(self.url(TOKEN_PATH))
            .header(TOKEN_TTL_HEADER, self.token_ttl_seconds.to_string());
        let value = self.send(request, TOKEN_PATH).await?.trim().to_string();

        let lifetime = Duration::from_secs_f64(f64::from(self.token_ttl_seconds) * 0.8)
            .saturating_sub(Duration::from_secs(60));
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(Some(value))
    }

    async fn fetch(&self, path: &str) -> std::result::Result<String, MetadataHttpError> {
        let token = match self.session_token().await {
            Ok(token) => token,
            // Older instances without IMDSv2 answer the token call with 403/404
            Err(e) if matches!(e.status, Some(403) | Some(404)) => None,
            Err(e) => return Err(e),
        };

        let mut request = self.http.get(self.url(path));
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }
        self.send(request, path).await
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> std::result::Result<String, MetadataHttpError> {
        let url = self.url(path);
        let response = request.send().await.map_err(|e| MetadataHttpError {
            url: url.clone(),
            status: None,
            message: format!("request failed: {e}"),
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| MetadataHttpError {
            url: url.clone(),
            status: Some(status.as_u16()),
            message: format!("read body failed: {e}"),
        })?;

        if !status.is_success() {
            return Err(MetadataHttpError {
                url,
                status: Some(status.as_u16()),
                message: error_snippet(&body),
            });
        }
        Ok(body)
    }
}

/// Longest error body excerpt carried in an error, in characters
const ERROR_SNIPPET_CHARS: usize = 80;

/// Whitespace-collapsed excerpt of an error body, cut on a character boundary
fn error_snippet(body: &str) -> String {
    body.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(ERROR_SNIPPET_CHARS)
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawCredentials {
    access_key_id: String,
    access_key_secret: String,
    security_token: String,
    expiration: String,
    #[serde(default)]
    last_updated: String,
    #[serde(default)]
    code: String,
}

/// Instance-metadata client for ECS hosts
#[derive(Debug, Clone)]
pub struct EcsMetadataClient {
    inner: Arc<Inner>,
    role_name: Option<String>,
    retry: RetryPolicy,
}

impl EcsMetadataClient {
    /// Create a client from explicit options
    pub fn new(options: MetadataClientOptions) -> Result<Self> {
        if options.token_ttl_seconds == 0 || options.token_ttl_seconds > MAX_TOKEN_TTL_SECONDS {
            return Err(PluginError::config(format!(
                "invalid metadata token TTL {}s, expected 1..={MAX_TOKEN_TTL_SECONDS}",
                options.token_ttl_seconds
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| PluginError::metadata(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                endpoint: options.endpoint.trim_end_matches('/').to_string(),
                disable_imdsv2: options.disable_imdsv2,
                token_ttl_seconds: options.token_ttl_seconds,
                token: Mutex::new(None),
            }),
            role_name: options.role_name.filter(|r| !r.is_empty()),
            retry: options.retry,
        })
    }

    /// Create a client configured from the environment
    pub fn from_env(env: &Environment) -> Result<Self> {
        Self::new(MetadataClientOptions::from_env(env))
    }

    async fn get_string(&self, path: &str) -> Result<String> {
        debug!(path = %path, "Querying instance metadata");

        let timer = MetricsTimer::start(Provider::Metadata, "GetMetadata");
        let inner = Arc::clone(&self.inner);
        let owned_path = path.to_string();
        let result = with_backoff("instance_metadata", self.retry.clone(), move |_attempt| {
            let inner = Arc::clone(&inner);
            let path = owned_path.clone();
            Box::pin(async move {
                inner
                    .fetch(&path)
                    .await
                    .map_err(|e| classify("instance_metadata", e))
            })
        })
        .await
        .map_err(|e| PluginError::metadata(e.to_string()));
        timer.observe(&result);
        result
    }

    async fn get_trimmed(&self, path: &str) -> Result<String> {
        Ok(self.get_string(path).await?.trim().to_string())
    }
}

#[async_trait]
impl MetadataService for EcsMetadataClient {
    async fn region_id(&self) -> Result<String> {
        self.get_trimmed(REGION_PATH).await
    }

    async fn zone_id(&self) -> Result<String> {
        self.get_trimmed(ZONE_PATH).await
    }

    async fn role_name(&self) -> Result<String> {
        if let Some(role) = &self.role_name {
            return Ok(role.clone());
        }
        let role = self.get_trimmed(ROLE_PATH).await?;
        if role.is_empty() {
            return Err(PluginError::metadata("no RAM role is attached to this instance"));
        }
        Ok(role)
    }

    async fn role_credentials(&self, role_name: &str) -> Result<RoleCredentials> {
        let raw = self.get_string(&format!("{ROLE_PATH}{role_name}")).await?;
        parse_role_credentials(&raw)
    }
}

fn parse_role_credentials(raw: &str) -> Result<RoleCredentials> {
    let parsed: RawCredentials = serde_json::from_str(raw)
        .map_err(|e| PluginError::metadata(format!("parse credentials failed: {e}")))?;

    if !parsed.code.is_empty() && parsed.code != "Success" {
        return Err(PluginError::metadata(format!(
            "metadata service returned credential code {}",
            parsed.code
        )));
    }

    let expiration = DateTime::parse_from_rfc3339(&parsed.expiration)
        .map_err(|e| {
            PluginError::metadata(format!("parse Expiration ({}) failed: {e}", parsed.expiration))
        })?
        .with_timezone(&Utc);
    let last_updated = DateTime::parse_from_rfc3339(&parsed.last_updated)
        .ok()
        .map(|t| t.with_timezone(&Utc));

    Ok(RoleCredentials {
        access_key_id: parsed.access_key_id,
        access_key_secret: parsed.access_key_secret,
        security_token: parsed.security_token,
        expiration,
        last_updated,
        code: parsed.code,
    })
}
