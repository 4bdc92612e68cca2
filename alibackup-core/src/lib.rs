/*!
# alibackup core

Alibaba Cloud provider for Velero-style backup orchestrators.

The crate implements the three extension points a backup host drives:

- [`ObjectStore`]: backup artifacts in OSS
- [`VolumeSnapshotter`]: ECS disk snapshots, with zone-aware restores
- [`RestoreItemMutator`]: restore-time rewriting of volume claims and volumes

## Architecture

Adapters depend on capability traits rather than concrete SDK clients:
- [`oss::ObjectStoreApi`] and [`ecs::ComputeApi`] describe what the adapters
  need from the provider
- [`metadata::MetadataService`] describes the instance-metadata service
- [`client::ClientBuilder`] builds clients from a [`CredentialSet`], and
  [`client::RefreshingClient`] rebuilds them when a RAM role session rotates

## Usage

```rust,no_run
use alibackup_core::{ObjectStore, ObjectStorePlugin, PluginContext};
use std::collections::HashMap;

# async fn run() -> alibackup_core::Result<()> {
let context = PluginContext::from_process()?;
let mut store = ObjectStore::new(context);
store.init(&HashMap::from([("region".to_string(), "cn-hangzhou".to_string())])).await?;

let keys = store.list_objects("velero", "backups/").await?;
# Ok(())
# }
```
*/

pub mod client;
pub mod config;
pub mod credentials;
pub mod ecs;
pub mod error;
pub mod metadata;
pub mod object_store;
pub mod observability;
pub mod oss;
pub mod plugin;
pub mod restore;
pub mod snapshotter;
pub mod tags;
pub mod token;
pub mod zone;

/// Serializes tests sharing the process-global mockito server
#[cfg(test)]
pub(crate) static HTTP_MOCK_LOCK: once_cell::sync::Lazy<tokio::sync::Mutex<()>> =
    once_cell::sync::Lazy::new(|| tokio::sync::Mutex::new(()));

pub use client::{ClientBinding, ClientBuilder, RefreshingClient};
pub use config::{Environment, NetworkType, PluginConfig};
pub use credentials::{CredentialResolver, CredentialSet};
pub use error::{ApiError, PluginError, Result};
pub use metadata::{EcsMetadataClient, MetadataCache, MetadataResolver, MetadataService};
pub use object_store::ObjectStore;
pub use plugin::{ObjectStorePlugin, PluginContext, RestoreItemAction, VolumeSnapshotterPlugin};
pub use restore::RestoreItemMutator;
pub use snapshotter::VolumeSnapshotter;
pub use token::TokenRefresher;
pub use zone::{determine_zone, ZoneKnowledge};
