//! Configuration parsing for the plugin adapters
//!
//! The host hands each adapter a flat string map at `init`. This module turns
//! that map into a typed [`PluginConfig`], rejecting keys the adapter does not
//! understand, and captures the process environment as an immutable
//! [`Environment`] snapshot that credential resolution reads from.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::{PluginError, Result};

pub const REGION_CONFIG_KEY: &str = "region";
pub const ZONE_CONFIG_KEY: &str = "zone";
pub const NETWORK_CONFIG_KEY: &str = "network";
pub const ENDPOINT_CONFIG_KEY: &str = "endpoint";
pub const NOT_ON_ECS_CONFIG_KEY: &str = "notOnECS";
pub const CREDENTIALS_FILE_CONFIG_KEY: &str = "credentialsFile";
/// Keys the host always passes to object stores alongside plugin keys.
pub const BUCKET_CONFIG_KEY: &str = "bucket";
pub const PREFIX_CONFIG_KEY: &str = "prefix";
pub const CA_CERT_CONFIG_KEY: &str = "caCert";

/// Keys accepted by the object store adapter.
pub const OBJECT_STORE_CONFIG_KEYS: &[&str] = &[
    REGION_CONFIG_KEY,
    NETWORK_CONFIG_KEY,
    ENDPOINT_CONFIG_KEY,
    NOT_ON_ECS_CONFIG_KEY,
    CREDENTIALS_FILE_CONFIG_KEY,
    BUCKET_CONFIG_KEY,
    PREFIX_CONFIG_KEY,
    CA_CERT_CONFIG_KEY,
];

/// Keys accepted by the volume snapshotter adapter.
pub const VOLUME_SNAPSHOTTER_CONFIG_KEYS: &[&str] = &[
    REGION_CONFIG_KEY,
    ZONE_CONFIG_KEY,
    NOT_ON_ECS_CONFIG_KEY,
    CREDENTIALS_FILE_CONFIG_KEY,
];

/// Region used when neither config nor instance metadata yields one.
pub const DEFAULT_REGION: &str = "cn-hangzhou";

pub const ENV_ACCESS_KEY_ID: &str = "ALIBABA_CLOUD_ACCESS_KEY_ID";
pub const ENV_ACCESS_KEY_SECRET: &str = "ALIBABA_CLOUD_ACCESS_KEY_SECRET";
pub const ENV_STS_TOKEN: &str = "ALIBABA_CLOUD_ACCESS_STS_TOKEN";
/// Deprecated: use the `credentialsFile` config key.
pub const ENV_CREDENTIALS_FILE: &str = "ALIBABA_CLOUD_CREDENTIALS_FILE";
pub const ENV_RAM_ROLE: &str = "ALIBABA_CLOUD_RAM_ROLE";
pub const ENV_CLUSTER_NAME: &str = "ACK_CLUSTER_NAME";
/// Deprecated: use the `notOnECS` config key.
pub const ENV_VELERO_FOR_ACK: &str = "VELERO_FOR_ACK";
pub const ENV_ENCRYPTION_KEY_ID: &str = "ALIBABA_CLOUD_ENCRYPTION_KEY_ID";

/// Network path used to reach OSS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkType {
    /// Public internet endpoint
    #[default]
    Public,
    /// VPC-internal endpoint in the same region
    Internal,
    /// Global transfer acceleration endpoint
    Accelerate,
}

impl NetworkType {
    /// Parse the `network` config value; anything unrecognised means public.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "internal" => NetworkType::Internal,
            "accelerate" => NetworkType::Accelerate,
            _ => NetworkType::Public,
        }
    }
}

/// Typed view of the host-supplied configuration map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginConfig {
    pub region: Option<String>,
    pub zone: Option<String>,
    pub network: NetworkType,
    pub endpoint: Option<String>,
    pub not_on_ecs: bool,
    pub credentials_file: Option<PathBuf>,
}

impl PluginConfig {
    /// Parse a host config map, rejecting keys outside `allowed_keys`.
    pub fn from_map(config: &HashMap<String, String>, allowed_keys: &[&str]) -> Result<Self> {
        let mut unknown: Vec<&str> = config
            .keys()
            .map(String::as_str)
            .filter(|key| !allowed_keys.contains(key))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(PluginError::config(format!(
                "config has invalid keys {unknown:?}; valid keys are {allowed_keys:?}"
            )));
        }

        let non_empty = |key: &str| {
            config
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Ok(PluginConfig {
            region: non_empty(REGION_CONFIG_KEY),
            zone: non_empty(ZONE_CONFIG_KEY),
            network: non_empty(NETWORK_CONFIG_KEY)
                .map(|v| NetworkType::parse(&v))
                .unwrap_or_default(),
            endpoint: non_empty(ENDPOINT_CONFIG_KEY),
            not_on_ecs: non_empty(NOT_ON_ECS_CONFIG_KEY)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            credentials_file: non_empty(CREDENTIALS_FILE_CONFIG_KEY).map(PathBuf::from),
        })
    }

    /// Whether instance-metadata role discovery is expected to work.
    ///
    /// `notOnECS=true` wins; otherwise the deprecated `VELERO_FOR_ACK=false`
    /// opts out. Everything else is treated as a managed cluster.
    pub fn is_managed_environment(&self, env: &Environment) -> bool {
        if self.not_on_ecs {
            return false;
        }
        !env
            .get(ENV_VELERO_FOR_ACK)
            .map(|v| v.eq_ignore_ascii_case("false"))
            .unwrap_or(false)
    }

    /// Credentials file path: config key first, then the deprecated env var.
    pub fn credentials_file_path(&self, env: &Environment) -> Option<PathBuf> {
        self.credentials_file
            .clone()
            .or_else(|| env.get(ENV_CREDENTIALS_FILE).map(PathBuf::from))
    }
}

/// Immutable snapshot of environment variables
///
/// Empty values are treated as unset, matching how the variables are consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Capture the current process environment
    pub fn from_process() -> Self {
        Self::from_pairs(std::env::vars())
    }

    /// Build an environment from explicit pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Look up a non-empty variable
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// New snapshot where `overrides` replace existing values, including with empties.
    pub fn overlay<I>(&self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut vars = self.vars.clone();
        vars.extend(overrides);
        Self { vars }
    }
}
