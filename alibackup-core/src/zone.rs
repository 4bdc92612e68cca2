/*!
Zone affinity for restored disks.

A disk restored from a snapshot goes back to the zone its source disk lived
in when the cluster can still use that zone, and otherwise to the zone the
restore runs in. The set of usable zones comes from the cluster profile, a
ConfigMap whose `vsw-zone` entry lists the cluster's vSwitches and their zones.
*/

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{PluginError, Result};

/// Cluster profile key listing `vswitch:zone` pairs
pub const VSW_ZONE_KEY: &str = "vsw-zone";

/// Where the cluster profile ConfigMap is mounted by default
pub const DEFAULT_CLUSTER_PROFILE_DIR: &str = "/etc/alibackup/cluster-profile";

/// Zone for a disk restored from a snapshot.
///
/// * no recorded origin: `current`
/// * origin equals `current`: the origin
/// * origin usable by the cluster: the origin
/// * otherwise: `current`
pub fn determine_zone(origin: Option<&str>, current: &str, supported: &BTreeSet<String>) -> String {
    match origin.filter(|zone| !zone.is_empty()) {
        None => current.to_string(),
        Some(origin) if origin == current => origin.to_string(),
        Some(origin) if supported.contains(origin) => origin.to_string(),
        Some(_) => current.to_string(),
    }
}

/// Zones known to the volume snapshotter, fixed after initialization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneKnowledge {
    pub current_zone: String,
    pub supported_zones: BTreeSet<String>,
}

impl ZoneKnowledge {
    pub fn new(current_zone: impl Into<String>, supported_zones: BTreeSet<String>) -> Self {
        Self {
            current_zone: current_zone.into(),
            supported_zones,
        }
    }

    /// Resolve the restore zone for a snapshot whose source lived in `origin`,
    /// with `current` standing in for the zone the restore runs in.
    pub fn resolve(&self, origin: Option<&str>, current: &str) -> String {
        let zone = determine_zone(origin, current, &self.supported_zones);
        if let Some(origin) = origin.filter(|o| !o.is_empty() && *o != zone) {
            warn!(
                original_zone = %origin,
                zone = %zone,
                "Original zone is not usable by this cluster, restoring into the current zone"
            );
        }
        zone
    }
}

/// Extract the usable zones from cluster profile data.
///
/// # Errors
/// Returns a configuration error when `data` is absent or has no
/// [`VSW_ZONE_KEY`] entry.
pub fn parse_cluster_profile(data: Option<&HashMap<String, String>>) -> Result<BTreeSet<String>> {
    let data = data.ok_or_else(|| PluginError::config("cluster profile data is nil"))?;
    let value = data
        .get(VSW_ZONE_KEY)
        .ok_or_else(|| PluginError::config(format!("{VSW_ZONE_KEY} field not found in cluster profile")))?;

    Ok(value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| pair.split_once(':'))
        .map(|(_, zone)| zone.trim())
        .filter(|zone| !zone.is_empty())
        .map(str::to_string)
        .collect())
}

/// Source of cluster profile data
#[async_trait]
pub trait ClusterProfileSource: Send + Sync {
    /// Profile entries, or `None` when no profile is available
    async fn load(&self) -> Result<Option<HashMap<String, String>>>;
}

/// Cluster profile ConfigMap mounted as a directory, one file per key
#[derive(Debug, Clone)]
pub struct MountedClusterProfile {
    dir: PathBuf,
}

impl MountedClusterProfile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Default for MountedClusterProfile {
    fn default() -> Self {
        Self::new(DEFAULT_CLUSTER_PROFILE_DIR)
    }
}

#[async_trait]
impl ClusterProfileSource for MountedClusterProfile {
    async fn load(&self) -> Result<Option<HashMap<String, String>>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            debug!(dir = %self.dir.display(), "No cluster profile mounted");
            return Ok(None);
        }

        let mut data = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Kubelet bookkeeping entries (..data, timestamped dirs)
            if name.starts_with('.') {
                continue;
            }
            if !tokio::fs::metadata(entry.path()).await?.is_file() {
                continue;
            }
            data.insert(name, tokio::fs::read_to_string(entry.path()).await?);
        }
        Ok(Some(data))
    }
}

/// Load the supported zones, treating any failure as "no information".
pub async fn load_supported_zones(source: &dyn ClusterProfileSource) -> BTreeSet<String> {
    let loaded = match source.load().await {
        Ok(data) => parse_cluster_profile(data.as_ref()),
        Err(e) => Err(e),
    };

    match loaded {
        Ok(zones) => {
            debug!(zones = ?zones, "Loaded supported zones from cluster profile");
            zones
        }
        Err(e) => {
            warn!(error = %e, "Cluster profile unavailable, zone fallback limited to the current zone");
            BTreeSet::new()
        }
    }
}
