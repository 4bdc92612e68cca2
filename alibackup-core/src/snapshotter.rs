/*!
Volume snapshotter adapter over ECS disks and snapshots.

Restores place the new disk according to [`crate::zone`]: the zone recorded on
the snapshot when the cluster can still use it, otherwise the zone the restore
runs in. Snapshots record the source disk's zone so the next restore can make
that decision.
*/

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::client::{ClientBuilder, RefreshingClient};
use crate::config::{PluginConfig, DEFAULT_REGION, ENV_CLUSTER_NAME, VOLUME_SNAPSHOTTER_CONFIG_KEYS};
use crate::ecs::{
    ComputeApi, CreateDiskRequest, CreateSnapshotRequest, DiskRecord, EcsClientBuilder, SnapshotRecord,
};
use crate::observability::{observed, Provider};
use crate::plugin::{PluginContext, VolumeSnapshotterPlugin};
use crate::tags::{disk_tags_from_snapshot, original_zone, snapshot_tags};
use crate::zone::{load_supported_zones, ZoneKnowledge};
use crate::{PluginError, Result};

pub const CSI_DISK_DRIVER: &str = "diskplugin.csi.alibabacloud.com";
pub const FLEX_DISK_DRIVER: &str = "alicloud/disk";
/// Canonical FlexVolume option holding the disk ID
pub const FLEX_VOLUME_ID_KEY: &str = "VolumeId";
/// Legacy spelling of [`FLEX_VOLUME_ID_KEY`]
pub const FLEX_LEGACY_VOLUME_ID_KEY: &str = "volumeId";

/// Upper IOPS bound of each ESSD performance level
pub const PERFORMANCE_LEVELS: [(&str, i64); 4] = [
    ("PL0", 10_000),
    ("PL1", 50_000),
    ("PL2", 100_000),
    ("PL3", 1_000_000),
];

/// Smallest ESSD performance level whose IOPS ceiling covers `iops`
pub fn performance_level_from_iops(iops: i64) -> &'static str {
    PERFORMANCE_LEVELS
        .iter()
        .find(|(_, max)| iops <= *max)
        .map(|(level, _)| *level)
        .unwrap_or("PL3")
}

fn spec_section<'a>(pv: &'a Value, name: &str) -> Option<&'a Value> {
    pv.get("spec").and_then(|spec| spec.get(name)).filter(|v| !v.is_null())
}

fn driver_of(section: &Value) -> &str {
    section.get("driver").and_then(Value::as_str).unwrap_or_default()
}

fn check_driver(kind: &str, driver: &str, expected: &str) -> Result<()> {
    if driver != expected {
        return Err(PluginError::config(format!("unsupported {kind} driver: {driver}")));
    }
    Ok(())
}

/// Disk ID of a persistent volume manifest.
///
/// CSI volumes carry it in `spec.csi.volumeHandle`; FlexVolume volumes in the
/// `VolumeId` option, falling back to the legacy `volumeId`. A volume using
/// neither yields an empty ID.
pub fn get_volume_id(pv: &Value) -> Result<String> {
    if let Some(csi) = spec_section(pv, "csi") {
        check_driver("CSI", driver_of(csi), CSI_DISK_DRIVER)?;
        return csi
            .get("volumeHandle")
            .and_then(Value::as_str)
            .filter(|handle| !handle.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PluginError::config("spec.CSI.VolumeHandle not found"));
    }

    if let Some(flex) = spec_section(pv, "flexVolume") {
        check_driver("FlexVolume", driver_of(flex), FLEX_DISK_DRIVER)?;
        let option = |key: &str| {
            flex.get("options")
                .and_then(|options| options.get(key))
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
        };
        return option(FLEX_VOLUME_ID_KEY)
            .or_else(|| option(FLEX_LEGACY_VOLUME_ID_KEY))
            .map(str::to_string)
            .ok_or_else(|| {
                PluginError::config(format!(
                    "spec.FlexVolume.Options['{FLEX_VOLUME_ID_KEY}'] or spec.FlexVolume.Options['{FLEX_LEGACY_VOLUME_ID_KEY}'] not found"
                ))
            });
    }

    Ok(String::new())
}

/// Copy of `pv` pointing at `volume_id`.
pub fn set_volume_id(pv: &Value, volume_id: &str) -> Result<Value> {
    let mut updated = pv.clone();

    if spec_section(pv, "csi").is_some() {
        let csi = &mut updated["spec"]["csi"];
        check_driver("CSI", driver_of(csi), CSI_DISK_DRIVER)?;
        csi["volumeHandle"] = Value::String(volume_id.to_string());
        return Ok(updated);
    }

    if spec_section(pv, "flexVolume").is_some() {
        let flex = &mut updated["spec"]["flexVolume"];
        check_driver("FlexVolume", driver_of(flex), FLEX_DISK_DRIVER)?;
        if !flex.get("options").map(Value::is_object).unwrap_or(false) {
            flex["options"] = Value::Object(Map::new());
        }
        flex["options"][FLEX_VOLUME_ID_KEY] = Value::String(volume_id.to_string());
        return Ok(updated);
    }

    Err(PluginError::config("spec.CSI or spec.FlexVolume not found"))
}

struct SnapshotterState {
    client: RefreshingClient<dyn ComputeApi>,
    zones: ZoneKnowledge,
    cluster_name: Option<String>,
}

/// ECS-backed volume snapshotter
pub struct VolumeSnapshotter {
    context: PluginContext,
    builder: Arc<dyn ClientBuilder<Client = dyn ComputeApi>>,
    state: Option<SnapshotterState>,
}

impl VolumeSnapshotter {
    pub fn new(context: PluginContext) -> Self {
        Self::with_client_builder(context, Arc::new(EcsClientBuilder))
    }

    pub fn with_client_builder(
        context: PluginContext,
        builder: Arc<dyn ClientBuilder<Client = dyn ComputeApi>>,
    ) -> Self {
        Self {
            context,
            builder,
            state: None,
        }
    }

    fn state(&self) -> Result<&SnapshotterState> {
        self.state
            .as_ref()
            .ok_or_else(|| PluginError::config("volume snapshotter is not initialized"))
    }

    /// Zones learned at initialization
    pub fn zone_knowledge(&self) -> Result<&ZoneKnowledge> {
        Ok(&self.state()?.zones)
    }

    async fn describe_snapshot(&self, client: &dyn ComputeApi, snapshot_id: &str) -> Result<SnapshotRecord> {
        let mut records = observed(
            Provider::Ecs,
            "DescribeSnapshots",
            snapshot_id,
            client.describe_snapshots(snapshot_id),
        )
        .await?;

        if records.len() != 1 {
            return Err(PluginError::integrity(format!(
                "expected 1 snapshot from DescribeSnapshots for {snapshot_id}, got {}",
                records.len()
            )));
        }
        Ok(records.remove(0))
    }

    async fn describe_disk(&self, client: &dyn ComputeApi, volume_id: &str, zone: &str) -> Result<DiskRecord> {
        let zone = Some(zone.to_string()).filter(|z| !z.is_empty());
        let mut records = observed(
            Provider::Ecs,
            "DescribeDisks",
            volume_id,
            client.describe_disks(volume_id, zone),
        )
        .await?;

        if records.len() != 1 {
            return Err(PluginError::integrity(format!(
                "expected 1 disk from DescribeDisks for volume ID {volume_id}, got {}",
                records.len()
            )));
        }
        Ok(records.remove(0))
    }

    /// Zone the restore runs in: the zone known from initialization, or a
    /// fresh metadata lookup when that was empty
    async fn current_zone(&self, state: &SnapshotterState) -> String {
        if !state.zones.current_zone.is_empty() {
            return state.zones.current_zone.clone();
        }
        self.context.metadata().zone(None).await
    }
}

#[async_trait]
impl VolumeSnapshotterPlugin for VolumeSnapshotter {
    async fn init(&mut self, config: &HashMap<String, String>) -> Result<()> {
        let config = PluginConfig::from_map(config, VOLUME_SNAPSHOTTER_CONFIG_KEYS)?;
        let env = self.context.env();
        let metadata = self.context.metadata();

        let region = metadata.region_or(config.region.as_deref(), DEFAULT_REGION).await;
        let current_zone = metadata.zone(config.zone.as_deref()).await;
        if current_zone.is_empty() {
            warn!("Current zone is unknown, it will be looked up again at restore time");
        }

        let managed = config.is_managed_environment(env);
        let resolver = self.context.credential_resolver();
        let credentials = resolver.resolve(&config, env, managed).await?;

        let supported_zones = load_supported_zones(self.context.cluster_profile()).await;

        let client: RefreshingClient<dyn ComputeApi> = RefreshingClient::new(
            Arc::clone(&self.builder),
            resolver.refresher().clone(),
            credentials,
            None,
            Some(&region),
        )?;

        info!(
            region = %region,
            zone = %current_zone,
            supported_zones = supported_zones.len(),
            "Volume snapshotter initialized"
        );
        self.state = Some(SnapshotterState {
            client,
            zones: ZoneKnowledge::new(current_zone, supported_zones),
            cluster_name: env.get(ENV_CLUSTER_NAME).map(str::to_string),
        });
        Ok(())
    }

    async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        volume_type: &str,
        _volume_zone: &str,
        iops: Option<i64>,
    ) -> Result<String> {
        let state = self.state()?;
        let client = state.client.current().await?;

        // Placement follows the snapshot's recorded zone, never the zone the
        // host remembers for the source volume.
        let snapshot = self.describe_snapshot(client.as_ref(), snapshot_id).await?;
        let current = self.current_zone(state).await;

        let zone = state.zones.resolve(original_zone(&snapshot.tags), &current);
        if zone.is_empty() {
            return Err(PluginError::metadata(format!(
                "cannot determine a zone for the disk restored from snapshot {snapshot_id}"
            )));
        }

        let performance_level = iops.map(|iops| {
            let level = performance_level_from_iops(iops);
            warn!(
                iops,
                performance_level = level,
                "Converting IOPS to a performance level; only ESSD disks support performance levels"
            );
            level.to_string()
        });

        let request = CreateDiskRequest {
            snapshot_id: snapshot_id.to_string(),
            zone_id: zone.clone(),
            disk_category: volume_type.to_string(),
            encrypted: snapshot.encrypted,
            performance_level,
            tags: disk_tags_from_snapshot(state.cluster_name.as_deref(), &snapshot.tags),
        };

        let disk_id = observed(Provider::Ecs, "CreateDisk", snapshot_id, client.create_disk(request))
            .await?
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PluginError::integrity("create disk response missing disk ID"))?;

        info!(snapshot_id = %snapshot_id, volume_id = %disk_id, zone = %zone, "Created disk from snapshot");
        Ok(disk_id)
    }

    async fn get_volume_info(&self, volume_id: &str, volume_zone: &str) -> Result<(String, Option<i64>)> {
        let client = self.state()?.client.current().await?;
        let disk = self.describe_disk(client.as_ref(), volume_id, volume_zone).await?;
        Ok((disk.category, disk.iops))
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        volume_zone: &str,
        tags: &HashMap<String, String>,
    ) -> Result<String> {
        let client = self.state()?.client.current().await?;
        let disk = self.describe_disk(client.as_ref(), volume_id, volume_zone).await?;

        let request = CreateSnapshotRequest {
            disk_id: volume_id.to_string(),
            tags: snapshot_tags(tags, &disk.tags, &disk.zone_id),
        };

        let snapshot_id = observed(Provider::Ecs, "CreateSnapshot", volume_id, client.create_snapshot(request))
            .await?
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PluginError::integrity("create snapshot response missing snapshot ID"))?;

        info!(volume_id = %volume_id, snapshot_id = %snapshot_id, zone = %disk.zone_id, "Created snapshot");
        Ok(snapshot_id)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let client = self.state()?.client.current().await?;
        match observed(Provider::Ecs, "DeleteSnapshot", snapshot_id, client.delete_snapshot(snapshot_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_snapshot_not_found() => {
                warn!(snapshot_id = %snapshot_id, "Snapshot not found, skip deleting");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn get_volume_id(&self, pv: &Value) -> Result<String> {
        get_volume_id(pv)
    }

    fn set_volume_id(&self, pv: &Value, volume_id: &str) -> Result<Value> {
        set_volume_id(pv, volume_id)
    }
}

#[cfg(test)]
#[path = "snapshotter_tests.rs"]
mod snapshotter_tests;
