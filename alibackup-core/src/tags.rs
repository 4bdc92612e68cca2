//! Tag sets for restored disks and new snapshots
//!
//! Tags are merged from up to three sources in precedence order: cluster
//! identity, caller-supplied tags, then the tags already on the source disk or
//! snapshot. A key is only taken from a later source when no earlier source
//! set it. Cluster identity keys carried over from the source are dropped
//! whenever a current cluster name is known, so restored disks are always
//! owned by the cluster doing the restore.

use std::collections::HashMap;

use crate::ecs::Tag;

pub const CLUSTER_OWNERSHIP_TAG_PREFIX: &str = "kubernetes.io/cluster/";
pub const CLUSTER_NAME_TAG: &str = "KubernetesCluster";
/// Records the zone of the source disk on each snapshot
pub const ORIGINAL_ZONE_TAG: &str = "velero.alibabacloud.com/original-volume-az";

fn is_cluster_identity_key(key: &str) -> bool {
    key.starts_with(CLUSTER_OWNERSHIP_TAG_PREFIX) || key == CLUSTER_NAME_TAG
}

/// Ownership tags for `cluster_name`, empty when no cluster is known
pub fn cluster_tags(cluster_name: Option<&str>) -> Vec<Tag> {
    match cluster_name.filter(|name| !name.is_empty()) {
        Some(name) => vec![
            Tag::new(format!("{CLUSTER_OWNERSHIP_TAG_PREFIX}{name}"), "owned"),
            Tag::new(CLUSTER_NAME_TAG, name),
        ],
        None => Vec::new(),
    }
}

/// Merge the three tag sources; see the module docs for precedence.
pub fn merge_tags(cluster_name: Option<&str>, caller: &[Tag], source: &[Tag]) -> Vec<Tag> {
    let cluster_name = cluster_name.filter(|name| !name.is_empty());
    let mut merged = cluster_tags(cluster_name);

    for tag in caller.iter().chain(source) {
        if cluster_name.is_some() && is_cluster_identity_key(&tag.key) {
            continue;
        }
        if merged.iter().any(|existing| existing.key == tag.key) {
            continue;
        }
        merged.push(tag.clone());
    }
    merged
}

/// Tags for a disk restored from a snapshot carrying `snapshot_tags`
pub fn disk_tags_from_snapshot(cluster_name: Option<&str>, snapshot_tags: &[Tag]) -> Vec<Tag> {
    merge_tags(cluster_name, &[], snapshot_tags)
}

/// Caller tags in a stable order
pub fn sorted_tags(tags: &HashMap<String, String>) -> Vec<Tag> {
    let mut sorted: Vec<Tag> = tags.iter().map(|(k, v)| Tag::new(k.as_str(), v.as_str())).collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));
    sorted
}

/// Tags for a snapshot of a disk in `volume_zone`.
///
/// No cluster identity is added; a snapshot only takes an owner when a disk
/// is restored from it. The original-zone tag is added unless the caller or
/// the disk already set it, or the zone is unknown.
pub fn snapshot_tags(caller: &HashMap<String, String>, volume_tags: &[Tag], volume_zone: &str) -> Vec<Tag> {
    let mut merged = merge_tags(None, &sorted_tags(caller), volume_tags);
    if !volume_zone.is_empty() && !merged.iter().any(|tag| tag.key == ORIGINAL_ZONE_TAG) {
        merged.push(Tag::new(ORIGINAL_ZONE_TAG, volume_zone));
    }
    merged
}

/// Original zone recorded on a snapshot, if any
pub fn original_zone(tags: &[Tag]) -> Option<&str> {
    tags.iter()
        .find(|tag| tag.key == ORIGINAL_ZONE_TAG)
        .map(|tag| tag.value.as_str())
        .filter(|zone| !zone.is_empty())
}
