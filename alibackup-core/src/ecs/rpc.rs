/*!
ECS RPC client.

Requests are signed GET calls against the regional ECS endpoint using the
HMAC-SHA1 signature (version 1.0) scheme. Responses are JSON.
*/

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha1::Sha1;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ComputeApi, CreateDiskRequest, CreateSnapshotRequest, DiskRecord, SnapshotRecord, Tag};
use crate::client::{ecs_endpoint, ClientBuilder};
use crate::credentials::CredentialSet;
use crate::config::DEFAULT_REGION;
use crate::{ApiError, PluginError, Result};

pub const API_VERSION: &str = "2014-05-26";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

type HmacSha1 = Hmac<Sha1>;

/// RFC 3986 encoding as required by the signature scheme
fn percent_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
        .replace('*', "%2A")
        .replace("%7E", "~")
}

/// Canonical query string and its signature for `params`.
fn sign(params: &BTreeMap<String, String>, access_key_secret: &str) -> Result<(String, String)> {
    let canonical = params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let string_to_sign = format!("GET&{}&{}", percent_encode("/"), percent_encode(&canonical));

    let mut mac = HmacSha1::new_from_slice(format!("{access_key_secret}&").as_bytes())
        .map_err(|e| PluginError::config(format!("invalid signing key: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    Ok((canonical, signature))
}

/// `["id"]` list syntax used by the describe calls
fn id_list(id: &str) -> String {
    serde_json::Value::from(vec![id]).to_string()
}

fn push_tags(params: &mut BTreeMap<String, String>, tags: &[Tag]) {
    for (i, tag) in tags.iter().enumerate() {
        params.insert(format!("Tag.{}.Key", i + 1), tag.key.clone());
        params.insert(format!("Tag.{}.Value", i + 1), tag.value.clone());
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
    request_id: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct RawTags {
    #[serde(default)]
    tag: Vec<RawTag>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawTag {
    #[serde(default)]
    tag_key: String,
    #[serde(default)]
    tag_value: String,
}

fn tags_from(raw: Option<RawTags>) -> Vec<Tag> {
    raw.unwrap_or_default()
        .tag
        .into_iter()
        .map(|t| Tag::new(t.tag_key, t.tag_value))
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSnapshotsBody {
    snapshots: Option<SnapshotList>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnapshotList {
    snapshot: Option<Vec<RawSnapshot>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawSnapshot {
    snapshot_id: String,
    source_disk_id: Option<String>,
    encrypted: Option<bool>,
    tags: Option<RawTags>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeDisksBody {
    disks: Option<DiskList>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskList {
    disk: Option<Vec<RawDisk>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawDisk {
    disk_id: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    zone_id: String,
    #[serde(rename = "IOPS")]
    iops: Option<i64>,
    tags: Option<RawTags>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateDiskBody {
    disk_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateSnapshotBody {
    snapshot_id: Option<String>,
}

/// [`ComputeApi`] over the ECS RPC API
#[derive(Debug, Clone)]
pub struct EcsRpcClient {
    http: reqwest::Client,
    endpoint: String,
    region: String,
    access_key_id: String,
    access_key_secret: String,
    security_token: Option<String>,
}

impl EcsRpcClient {
    /// Create a client for `region`, or for an explicit `endpoint`.
    pub fn new(credentials: &CredentialSet, endpoint: Option<&str>, region: Option<&str>) -> Result<Self> {
        let region = region.unwrap_or(DEFAULT_REGION).to_string();
        let endpoint = endpoint
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| ecs_endpoint(&region));

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PluginError::config(format!("failed to build ECS HTTP client: {e}")))?;

        debug!(endpoint = %endpoint, region = %region, "Built ECS client");
        Ok(Self {
            http,
            endpoint,
            region,
            access_key_id: credentials.access_key_id().to_string(),
            access_key_secret: credentials.access_key_secret().to_string(),
            security_token: credentials.session_token().map(str::to_string),
        })
    }

    fn common_params(&self, action: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("Action".to_string(), action.to_string());
        params.insert("Format".to_string(), "JSON".to_string());
        params.insert("Version".to_string(), API_VERSION.to_string());
        params.insert("AccessKeyId".to_string(), self.access_key_id.clone());
        params.insert("SignatureMethod".to_string(), "HMAC-SHA1".to_string());
        params.insert("SignatureVersion".to_string(), "1.0".to_string());
        params.insert("SignatureNonce".to_string(), uuid::Uuid::new_v4().to_string());
        params.insert(
            "Timestamp".to_string(),
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        );
        params.insert("RegionId".to_string(), self.region.clone());
        if let Some(token) = &self.security_token {
            params.insert("SecurityToken".to_string(), token.clone());
        }
        params
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        extra: BTreeMap<String, String>,
    ) -> std::result::Result<T, ApiError> {
        let mut params = self.common_params(action);
        params.extend(extra);

        let (query, signature) =
            sign(&params, &self.access_key_secret).map_err(|e| ApiError::new(e.to_string()))?;
        let url = format!("{}/?{}&Signature={}", self.endpoint, query, percent_encode(&signature));

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::new(format!("{action} request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::new(format!("{action} body read failed: {e}")))?;

        if !status.is_success() {
            let mut error = ApiError::new(format!("{action} returned status {status}"))
                .with_status(status.as_u16());
            if let Ok(parsed) = serde_json::from_str::<ErrorBody>(&body) {
                if let Some(message) = parsed.message {
                    error.message = message;
                }
                error.code = parsed.code;
                error.request_id = parsed.request_id;
            }
            return Err(error);
        }

        serde_json::from_str(&body)
            .map_err(|e| ApiError::new(format!("{action} response is not valid JSON: {e}")))
    }
}

#[async_trait]
impl ComputeApi for EcsRpcClient {
    async fn describe_snapshots(
        &self,
        snapshot_id: &str,
    ) -> std::result::Result<Vec<SnapshotRecord>, ApiError> {
        let mut params = BTreeMap::new();
        params.insert("SnapshotIds".to_string(), id_list(snapshot_id));

        let body: DescribeSnapshotsBody = self.call("DescribeSnapshots", params).await?;
        let snapshots = body
            .snapshots
            .and_then(|list| list.snapshot)
            .ok_or_else(|| ApiError::new("invalid response from DescribeSnapshots"))?;

        Ok(snapshots
            .into_iter()
            .map(|s| SnapshotRecord {
                snapshot_id: s.snapshot_id,
                source_disk_id: s.source_disk_id,
                encrypted: s.encrypted,
                tags: tags_from(s.tags),
            })
            .collect())
    }

    async fn describe_disks(
        &self,
        disk_id: &str,
        zone_id: Option<String>,
    ) -> std::result::Result<Vec<DiskRecord>, ApiError> {
        let mut params = BTreeMap::new();
        params.insert("DiskIds".to_string(), id_list(disk_id));
        if let Some(zone_id) = zone_id.filter(|z| !z.is_empty()) {
            params.insert("ZoneId".to_string(), zone_id);
        }

        let body: DescribeDisksBody = self.call("DescribeDisks", params).await?;
        let disks = body
            .disks
            .and_then(|list| list.disk)
            .ok_or_else(|| ApiError::new("invalid response from DescribeDisks"))?;

        Ok(disks
            .into_iter()
            .map(|d| DiskRecord {
                disk_id: d.disk_id,
                category: d.category,
                zone_id: d.zone_id,
                iops: d.iops,
                tags: tags_from(d.tags),
            })
            .collect())
    }

    async fn create_disk(
        &self,
        request: CreateDiskRequest,
    ) -> std::result::Result<Option<String>, ApiError> {
        let mut params = BTreeMap::new();
        params.insert("SnapshotId".to_string(), request.snapshot_id);
        params.insert("ZoneId".to_string(), request.zone_id);
        params.insert("DiskCategory".to_string(), request.disk_category);
        if let Some(encrypted) = request.encrypted {
            params.insert("Encrypted".to_string(), encrypted.to_string());
        }
        if let Some(level) = request.performance_level {
            params.insert("PerformanceLevel".to_string(), level);
        }
        push_tags(&mut params, &request.tags);

        let body: CreateDiskBody = self.call("CreateDisk", params).await?;
        Ok(body.disk_id.filter(|id| !id.is_empty()))
    }

    async fn create_snapshot(
        &self,
        request: CreateSnapshotRequest,
    ) -> std::result::Result<Option<String>, ApiError> {
        let mut params = BTreeMap::new();
        params.insert("DiskId".to_string(), request.disk_id);
        push_tags(&mut params, &request.tags);

        let body: CreateSnapshotBody = self.call("CreateSnapshot", params).await?;
        Ok(body.snapshot_id.filter(|id| !id.is_empty()))
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> std::result::Result<(), ApiError> {
        let mut params = BTreeMap::new();
        params.insert("SnapshotId".to_string(), snapshot_id.to_string());

        let _: serde_json::Value = self.call("DeleteSnapshot", params).await?;
        Ok(())
    }
}

/// Builds [`EcsRpcClient`]s for the volume snapshotter
#[derive(Debug, Clone, Copy, Default)]
pub struct EcsClientBuilder;

impl ClientBuilder for EcsClientBuilder {
    type Client = dyn ComputeApi;

    fn build(
        &self,
        credentials: &CredentialSet,
        endpoint: Option<&str>,
        region: Option<&str>,
    ) -> Result<Arc<dyn ComputeApi>> {
        Ok(Arc::new(EcsRpcClient::new(credentials, endpoint, region)?))
    }
}
