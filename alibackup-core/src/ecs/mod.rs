/*!
Block storage capability surface.

[`ComputeApi`] covers the disk and snapshot calls the volume snapshotter
makes. [`EcsRpcClient`] implements it against the ECS RPC API.
*/

pub mod rpc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ApiError;

pub use rpc::{EcsClientBuilder, EcsRpcClient};

/// Resource tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Snapshot fields the snapshotter reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub source_disk_id: Option<String>,
    pub encrypted: Option<bool>,
    pub tags: Vec<Tag>,
}

/// Disk fields the snapshotter reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskRecord {
    pub disk_id: String,
    pub category: String,
    pub zone_id: String,
    pub iops: Option<i64>,
    pub tags: Vec<Tag>,
}

/// Parameters of a `CreateDisk` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateDiskRequest {
    pub snapshot_id: String,
    pub zone_id: String,
    pub disk_category: String,
    pub encrypted: Option<bool>,
    pub performance_level: Option<String>,
    pub tags: Vec<Tag>,
}

/// Parameters of a `CreateSnapshot` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSnapshotRequest {
    pub disk_id: String,
    pub tags: Vec<Tag>,
}

/// Disk and snapshot operations in one region.
///
/// Describe calls return every matching record; the caller enforces
/// cardinality. Create calls return `None` when the response carried no
/// identifier.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn describe_snapshots(&self, snapshot_id: &str) -> Result<Vec<SnapshotRecord>, ApiError>;

    async fn describe_disks(
        &self,
        disk_id: &str,
        zone_id: Option<String>,
    ) -> Result<Vec<DiskRecord>, ApiError>;

    async fn create_disk(&self, request: CreateDiskRequest) -> Result<Option<String>, ApiError>;

    async fn create_snapshot(
        &self,
        request: CreateSnapshotRequest,
    ) -> Result<Option<String>, ApiError>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), ApiError>;
}
