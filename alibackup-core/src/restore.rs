/*!
Restore-time manifest mutation for volume claims and volumes.

Each manifest is rewritten independently of the storage adapters:
* claims and volumes below the minimum disk size are grown to it, and their
  stale status is dropped;
* FlexVolume options spelled with the legacy `volumeId` key get the canonical
  `VolumeId` key as well;
* volumes pinned to a zone through the disk topology key are re-pinned to the
  zone the restore runs in.
*/

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::metadata::MetadataResolver;
use crate::plugin::{PluginContext, RestoreItemAction};
use crate::snapshotter::{FLEX_LEGACY_VOLUME_ID_KEY, FLEX_VOLUME_ID_KEY};
use crate::{PluginError, Result};

pub const PERSISTENT_VOLUME_KIND: &str = "PersistentVolume";
pub const PERSISTENT_VOLUME_CLAIM_KIND: &str = "PersistentVolumeClaim";
pub const RESTORE_ANNOTATION: &str = "velero.io/alibabacloud-restore-plugin";
pub const ZONE_TOPOLOGY_KEY: &str = "topology.diskplugin.csi.alibabacloud.com/zone";

/// Smallest disk the provider creates, in bytes (20Gi)
pub const MIN_DISK_SIZE_BYTES: u128 = 20 * 1024 * 1024 * 1024;
pub const MIN_DISK_SIZE: &str = "20Gi";

const BINARY_SUFFIXES: [(&str, u32); 6] = [("Ki", 1), ("Mi", 2), ("Gi", 3), ("Ti", 4), ("Pi", 5), ("Ei", 6)];
const DECIMAL_SUFFIXES: [(&str, u32); 6] = [("k", 1), ("M", 2), ("G", 3), ("T", 4), ("P", 5), ("E", 6)];

/// Parse a resource quantity such as `20Gi`, `500M`, `1e3` or `1073741824`
/// into bytes.
///
/// Fractions of a byte are rounded up.
pub fn parse_quantity(quantity: &str) -> Result<u128> {
    let quantity = quantity.trim();
    let invalid = || PluginError::manifest(format!("invalid quantity {quantity:?}"));

    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    if number.is_empty() {
        return Err(invalid());
    }

    // A bare `E` is exa; `E` or `e` followed by digits is a decimal exponent.
    let exponent = suffix
        .strip_prefix(['e', 'E'])
        .and_then(|rest| rest.parse::<i32>().ok());

    let multiplier: f64 = if let Some(exponent) = exponent {
        10f64.powi(exponent)
    } else if suffix.is_empty() {
        1.0
    } else if let Some((_, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        1024f64.powi(*power as i32)
    } else if let Some((_, power)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        1000f64.powi(*power as i32)
    } else if suffix == "m" {
        0.001
    } else {
        return Err(invalid());
    };

    // Whole numbers stay exact; fractional ones go through f64.
    if let Ok(whole) = number.parse::<u128>() {
        let exact = match exponent {
            Some(exponent) => u32::try_from(exponent).ok().map(|e| 10u128.checked_pow(e)),
            None if multiplier >= 1.0 => Some(Some(multiplier as u128)),
            None => None,
        };
        if let Some(factor) = exact {
            return factor.and_then(|f| whole.checked_mul(f)).ok_or_else(invalid);
        }
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let bytes = (value * multiplier).ceil();
    if !bytes.is_finite() || bytes >= u128::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u128)
}

fn kind_of(item: &Value) -> Result<&str> {
    item.get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| PluginError::manifest("item has no kind"))
}

fn object_mut<'a>(value: &'a mut Value, key: &str) -> Option<&'a mut Map<String, Value>> {
    value.get_mut(key).and_then(Value::as_object_mut)
}

fn annotate(item: &mut Value) -> Result<()> {
    let root = item
        .as_object_mut()
        .ok_or_else(|| PluginError::manifest("item is not an object"))?;
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        return Err(PluginError::manifest("metadata is not an object"));
    }
    let annotations = &mut metadata["annotations"];
    if !annotations.is_object() {
        *annotations = Value::Object(Map::new());
    }
    annotations[RESTORE_ANNOTATION] = Value::String("1".to_string());
    Ok(())
}

/// Raise the storage quantity at `path` to the minimum disk size.
///
/// Returns whether the manifest was changed.
fn enforce_min_size(item: &mut Value, path: &[&str]) -> Result<bool> {
    let mut cursor = &mut *item;
    for segment in path {
        match cursor.get_mut(*segment) {
            Some(next) => cursor = next,
            None => return Ok(false),
        }
    }
    let Some(quantity) = cursor.as_str() else {
        return Ok(false);
    };

    let bytes = parse_quantity(quantity)?;
    if bytes >= MIN_DISK_SIZE_BYTES {
        return Ok(false);
    }

    debug!(from = %quantity, to = MIN_DISK_SIZE, "Raising storage size to the disk minimum");
    *cursor = Value::String(MIN_DISK_SIZE.to_string());
    if let Some(root) = item.as_object_mut() {
        root.remove("status");
    }
    Ok(true)
}

/// Copy the legacy FlexVolume `volumeId` option into `VolumeId` when the
/// canonical key is empty.
fn normalize_flex_volume_id(pv: &mut Value) -> bool {
    let Some(options) = pv
        .get_mut("spec")
        .and_then(|spec| spec.get_mut("flexVolume"))
        .and_then(|flex| object_mut(flex, "options"))
    else {
        return false;
    };

    let present = |key: &str| {
        options
            .get(key)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    match (present(FLEX_VOLUME_ID_KEY), present(FLEX_LEGACY_VOLUME_ID_KEY)) {
        (None, Some(legacy)) => {
            options.insert(FLEX_VOLUME_ID_KEY.to_string(), Value::String(legacy));
            true
        }
        _ => false,
    }
}

/// First match expression of the first required node selector term, when it
/// pins the disk topology zone
fn zone_requirement(pv: &mut Value) -> Option<&mut Value> {
    let expression = pv
        .get_mut("spec")?
        .get_mut("nodeAffinity")?
        .get_mut("required")?
        .get_mut("nodeSelectorTerms")?
        .get_mut(0)?
        .get_mut("matchExpressions")?
        .get_mut(0)?;

    if expression.get("key").and_then(Value::as_str) == Some(ZONE_TOPOLOGY_KEY) {
        Some(expression)
    } else {
        None
    }
}

/// Rewrites volume claims and volumes on restore
#[derive(Clone)]
pub struct RestoreItemMutator {
    metadata: MetadataResolver,
}

impl RestoreItemMutator {
    pub fn new(context: &PluginContext) -> Self {
        Self {
            metadata: context.metadata().clone(),
        }
    }

    /// Mutated copy of `item`; unrecognized kinds pass through untouched.
    pub async fn mutate(&self, mut item: Value) -> Result<Value> {
        let kind = kind_of(&item)?.to_string();
        match kind.as_str() {
            PERSISTENT_VOLUME_CLAIM_KIND => {
                annotate(&mut item)?;
                enforce_min_size(&mut item, &["spec", "resources", "requests", "storage"])?;
            }
            PERSISTENT_VOLUME_KIND => {
                annotate(&mut item)?;
                let resized = enforce_min_size(&mut item, &["spec", "capacity", "storage"])?;
                if normalize_flex_volume_id(&mut item) {
                    info!("Copied legacy FlexVolume volumeId option to VolumeId");
                }
                // Only a resized volume is recreated, so only it moves zones.
                if resized && zone_requirement(&mut item).is_some() {
                    self.pin_zone(&mut item).await;
                }
            }
            other => {
                debug!(kind = %other, "Kind not handled, passing through");
            }
        }
        Ok(item)
    }

    async fn pin_zone(&self, pv: &mut Value) {
        let zone = self.metadata.zone(None).await;
        if zone.is_empty() {
            warn!("Current zone is unknown, keeping the volume's zone affinity");
            return;
        }
        if let Some(expression) = zone_requirement(pv) {
            expression["values"] = Value::Array(vec![Value::String(zone.clone())]);
            info!(zone = %zone, "Pinned volume node affinity to the current zone");
        }
    }
}

#[async_trait]
impl RestoreItemAction for RestoreItemMutator {
    fn applies_to(&self) -> Vec<String> {
        vec!["persistentvolumeclaims".to_string(), "persistentvolumes".to_string()]
    }

    async fn execute(&self, item: Value) -> Result<Value> {
        self.mutate(item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::metadata::MockMetadataService;
    use serde_json::json;
    use std::sync::Arc;

    fn mutator(zone: Option<&'static str>) -> RestoreItemMutator {
        let mut metadata = MockMetadataService::new();
        match zone {
            Some(zone) => {
                metadata.expect_zone_id().returning(move || Ok(zone.to_string()));
            }
            None => {
                metadata.expect_zone_id().times(0);
            }
        }
        RestoreItemMutator::new(&PluginContext::new(Environment::default(), Arc::new(metadata)))
    }

    fn pvc(storage: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {"name": "data", "annotations": {"existing": "yes"}},
            "spec": {"resources": {"requests": {"storage": storage}}},
            "status": {"phase": "Bound", "capacity": {"storage": storage}}
        })
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("20Gi").unwrap(), MIN_DISK_SIZE_BYTES);
        assert_eq!(parse_quantity("21474836480").unwrap(), MIN_DISK_SIZE_BYTES);
        assert_eq!(parse_quantity("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_quantity("10G").unwrap(), 10_000_000_000);
        assert_eq!(parse_quantity("1k").unwrap(), 1000);
        assert_eq!(parse_quantity("1.5Gi").unwrap(), 1_610_612_736);
        assert_eq!(parse_quantity("1500m").unwrap(), 2);
        assert!(parse_quantity("Gi").is_err());
        assert!(parse_quantity("1e").is_err());
        assert!(parse_quantity("1e3Gi").is_err());
        assert!(parse_quantity("20GB").is_err());
        assert!(parse_quantity("").is_err());
    }

    #[test]
    fn test_parse_quantity_exponent() {
        assert_eq!(parse_quantity("1e3").unwrap(), 1000);
        assert_eq!(parse_quantity("5E2").unwrap(), 500);
        assert_eq!(parse_quantity("1E").unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(parse_quantity("2.5e10").unwrap(), 25_000_000_000);
        assert_eq!(parse_quantity("2Ei").unwrap(), 2 << 60);
        assert_eq!(parse_quantity("15e-1").unwrap(), 2);
        assert_eq!(parse_quantity("1e+3").unwrap(), 1000);
        assert!(parse_quantity("1e40").is_err());
    }

    #[tokio::test]
    async fn test_exponent_sized_claim() {
        let out = mutator(None).mutate(pvc("2e10")).await.unwrap();
        assert_eq!(out["spec"]["resources"]["requests"]["storage"], MIN_DISK_SIZE);

        let out = mutator(None).mutate(pvc("3e10")).await.unwrap();
        assert_eq!(out["spec"]["resources"]["requests"]["storage"], "3e10");
    }

    #[test]
    fn test_applies_to() {
        assert_eq!(
            mutator(None).applies_to(),
            vec!["persistentvolumeclaims", "persistentvolumes"]
        );
    }

    #[tokio::test]
    async fn test_small_claim_grows_to_minimum() {
        let out = mutator(None).mutate(pvc("10Gi")).await.unwrap();
        assert_eq!(out["spec"]["resources"]["requests"]["storage"], "20Gi");
        assert!(out.get("status").is_none());
        assert_eq!(out["metadata"]["annotations"][RESTORE_ANNOTATION], "1");
        assert_eq!(out["metadata"]["annotations"]["existing"], "yes");
    }

    #[tokio::test]
    async fn test_large_claim_keeps_size_and_status() {
        let out = mutator(None).mutate(pvc("20Gi")).await.unwrap();
        assert_eq!(out["spec"]["resources"]["requests"]["storage"], "20Gi");
        assert_eq!(out["status"]["phase"], "Bound");

        let out = mutator(None).mutate(pvc("100G")).await.unwrap();
        assert_eq!(out["spec"]["resources"]["requests"]["storage"], "100G");
    }

    #[tokio::test]
    async fn test_invalid_size_is_manifest_error() {
        let err = mutator(None).mutate(pvc("lots")).await.unwrap_err();
        assert!(matches!(err, PluginError::Manifest(_)));
    }

    #[tokio::test]
    async fn test_flex_volume_normalization_is_idempotent() {
        let pv = json!({
            "kind": "PersistentVolume",
            "metadata": {"name": "pv-1"},
            "spec": {
                "capacity": {"storage": "25Gi"},
                "flexVolume": {"driver": "alicloud/disk", "options": {"volumeId": "d-test123"}}
            }
        });

        let mutator = mutator(None);
        let once = mutator.mutate(pv).await.unwrap();
        let options = &once["spec"]["flexVolume"]["options"];
        assert_eq!(options["volumeId"], "d-test123");
        assert_eq!(options["VolumeId"], "d-test123");

        let twice = mutator.mutate(once.clone()).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_flex_volume_canonical_key_wins() {
        let pv = json!({
            "kind": "PersistentVolume",
            "spec": {"flexVolume": {"driver": "alicloud/disk", "options": {"VolumeId": "d-new", "volumeId": "d-old"}}}
        });
        let out = mutator(None).mutate(pv).await.unwrap();
        assert_eq!(out["spec"]["flexVolume"]["options"]["VolumeId"], "d-new");
    }

    #[tokio::test]
    async fn test_flex_volume_without_legacy_key_unchanged() {
        let pv = json!({
            "kind": "PersistentVolume",
            "spec": {"flexVolume": {"driver": "alicloud/disk", "options": {"fsType": "ext4"}}}
        });
        let out = mutator(None).mutate(pv).await.unwrap();
        assert!(out["spec"]["flexVolume"]["options"].get("VolumeId").is_none());
    }

    fn zoned_pv(storage: &str) -> Value {
        json!({
            "kind": "PersistentVolume",
            "spec": {
                "capacity": {"storage": storage},
                "nodeAffinity": {"required": {"nodeSelectorTerms": [{
                    "matchExpressions": [{"key": ZONE_TOPOLOGY_KEY, "operator": "In", "values": ["cn-beijing-l"]}]
                }]}}
            }
        })
    }

    #[tokio::test]
    async fn test_zone_affinity_repinned_when_resized() {
        let out = mutator(Some("cn-beijing-k")).mutate(zoned_pv("10Gi")).await.unwrap();
        assert_eq!(out["spec"]["capacity"]["storage"], MIN_DISK_SIZE);
        let expression = &out["spec"]["nodeAffinity"]["required"]["nodeSelectorTerms"][0]["matchExpressions"][0];
        assert_eq!(expression["values"], json!(["cn-beijing-k"]));
        assert_eq!(expression["operator"], "In");
    }

    #[tokio::test]
    async fn test_full_size_volume_keeps_zone_affinity() {
        for storage in ["20Gi", "40Gi"] {
            let pv = zoned_pv(storage);
            let out = mutator(None).mutate(pv.clone()).await.unwrap();
            assert_eq!(out["spec"], pv["spec"], "{storage}");
        }
    }

    #[tokio::test]
    async fn test_other_affinity_keys_untouched() {
        let pv = json!({
            "kind": "PersistentVolume",
            "spec": {"nodeAffinity": {"required": {"nodeSelectorTerms": [{
                "matchExpressions": [{"key": "kubernetes.io/hostname", "operator": "In", "values": ["node-1"]}]
            }]}}}
        });

        let out = mutator(None).mutate(pv.clone()).await.unwrap();
        assert_eq!(out["spec"], pv["spec"]);
    }

    #[tokio::test]
    async fn test_unknown_kind_passes_through() {
        let item = json!({"kind": "ConfigMap", "metadata": {"name": "cm"}, "data": {"a": "b"}});
        let out = mutator(None).mutate(item.clone()).await.unwrap();
        assert_eq!(out, item);
    }

    #[tokio::test]
    async fn test_missing_kind_is_error() {
        let err = mutator(None).mutate(json!({"metadata": {}})).await.unwrap_err();
        assert!(matches!(err, PluginError::Manifest(_)));
    }
}
