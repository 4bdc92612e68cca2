/*!
alibackup CLI - drive the Alibaba Cloud backup plugin outside a backup host.

Each command initializes the relevant adapter with the `-c key=value` plugin
configuration and the process environment, then performs one operation.
Useful for checking credentials, bucket access and zone placement on a node.
*/

use alibackup_core::observability::init_observability;
use alibackup_core::{
    determine_zone, ObjectStore, ObjectStorePlugin, PluginContext, RestoreItemMutator,
    VolumeSnapshotter, VolumeSnapshotterPlugin,
};
use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "alibackup")]
#[command(about = "CLI for the Alibaba Cloud backup plugin")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Plugin configuration entry, repeatable (e.g. -c region=cn-beijing)
    #[arg(short = 'c', long = "config", global = true, value_parser = parse_key_val)]
    config: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Object storage operations
    #[command(subcommand)]
    Objects(ObjectCommands),
    /// Disk operations
    #[command(subcommand)]
    Volumes(VolumeCommands),
    /// Snapshot operations
    #[command(subcommand)]
    Snapshots(SnapshotCommands),
    /// Zone placement
    #[command(subcommand)]
    Zone(ZoneCommands),
    /// Restore-time manifest rewriting
    #[command(subcommand)]
    Restore(RestoreCommands),
}

#[derive(Subcommand)]
enum ObjectCommands {
    /// Upload a local file
    Put {
        bucket: String,
        key: String,
        file: PathBuf,
    },
    /// Download an object to a file, or stdout when no file is given
    Get {
        bucket: String,
        key: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check whether an object exists
    Exists { bucket: String, key: String },
    /// List every key under a prefix
    List {
        bucket: String,
        #[arg(short, long, default_value = "")]
        prefix: String,
    },
    /// List common prefixes under a prefix
    Prefixes {
        bucket: String,
        #[arg(short, long, default_value = "")]
        prefix: String,
        #[arg(short, long, default_value = "/")]
        delimiter: String,
    },
    /// Delete an object
    Delete { bucket: String, key: String },
    /// Print a pre-signed GET URL
    Sign {
        bucket: String,
        key: String,
        /// URL lifetime in seconds
        #[arg(long, default_value_t = 600)]
        ttl: u64,
    },
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// Show a disk's category and IOPS
    Info {
        volume_id: String,
        #[arg(short, long, default_value = "")]
        zone: String,
    },
    /// Create a disk from a snapshot
    Restore {
        snapshot_id: String,
        /// Disk category, e.g. cloud_essd
        #[arg(short = 't', long = "type")]
        volume_type: String,
        /// Zone to fall back to when the snapshot records none
        #[arg(short, long, default_value = "")]
        zone: String,
        #[arg(long)]
        iops: Option<i64>,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Snapshot a disk
    Create {
        volume_id: String,
        #[arg(short, long, default_value = "")]
        zone: String,
        /// Snapshot tag, repeatable
        #[arg(short, long = "tag", value_parser = parse_key_val)]
        tags: Vec<(String, String)>,
    },
    /// Delete a snapshot; missing snapshots are not an error
    Delete { snapshot_id: String },
}

#[derive(Subcommand)]
enum ZoneCommands {
    /// Compute the restore zone without contacting the cloud
    Resolve {
        /// Zone recorded on the snapshot
        #[arg(long)]
        origin: Option<String>,
        /// Zone the restore runs in
        #[arg(long)]
        current: String,
        /// Comma-separated zones the cluster can schedule into
        #[arg(long, value_delimiter = ',')]
        supported: Vec<String>,
    },
}

#[derive(Subcommand)]
enum RestoreCommands {
    /// Apply restore mutations to a JSON manifest and print the result
    Mutate { file: PathBuf },
}

#[derive(Tabled)]
struct KeyRow {
    #[tabled(rename = "Key")]
    key: String,
}

#[derive(Tabled)]
struct PrefixRow {
    #[tabled(rename = "Prefix")]
    prefix: String,
}

#[derive(Tabled)]
struct VolumeRow {
    #[tabled(rename = "Volume ID")]
    volume_id: String,
    #[tabled(rename = "Category")]
    category: String,
    #[tabled(rename = "IOPS")]
    iops: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    if cli.verbose && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "debug");
    }
    init_observability(cli.json)?;

    let config: HashMap<String, String> = cli.config.into_iter().collect();

    match cli.command {
        Commands::Objects(command) => run_objects(command, &config).await?,
        Commands::Volumes(command) => run_volumes(command, &config).await?,
        Commands::Snapshots(command) => run_snapshots(command, &config).await?,
        Commands::Zone(ZoneCommands::Resolve {
            origin,
            current,
            supported,
        }) => resolve_zone(origin.as_deref(), &current, supported),
        Commands::Restore(RestoreCommands::Mutate { file }) => mutate_manifest(&file).await?,
    }

    Ok(())
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid key=value pair: no `=` found in `{s}`"))?;
    if key.trim().is_empty() {
        return Err(format!("invalid key=value pair: empty key in `{s}`"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

async fn object_store(config: &HashMap<String, String>) -> Result<ObjectStore, anyhow::Error> {
    let mut store = ObjectStore::new(PluginContext::from_process()?);
    store
        .init(config)
        .await
        .context("failed to initialize object store")?;
    Ok(store)
}

async fn snapshotter(config: &HashMap<String, String>) -> Result<VolumeSnapshotter, anyhow::Error> {
    let mut snapshotter = VolumeSnapshotter::new(PluginContext::from_process()?);
    snapshotter
        .init(config)
        .await
        .context("failed to initialize volume snapshotter")?;
    Ok(snapshotter)
}

async fn run_objects(command: ObjectCommands, config: &HashMap<String, String>) -> Result<(), anyhow::Error> {
    let store = object_store(config).await?;

    match command {
        ObjectCommands::Put { bucket, key, file } => {
            let body = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let size = body.len();
            store.put_object(&bucket, &key, Bytes::from(body)).await?;
            println!("✓ Uploaded {size} bytes to {bucket}/{key}");
        }
        ObjectCommands::Get { bucket, key, output } => {
            let body = store.get_object(&bucket, &key).await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &body)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(bytes = body.len(), path = %path.display(), "Downloaded object");
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&body)?;
                }
            }
        }
        ObjectCommands::Exists { bucket, key } => {
            let exists = store.object_exists(&bucket, &key).await?;
            println!("{exists}");
        }
        ObjectCommands::List { bucket, prefix } => {
            let keys = store.list_objects(&bucket, &prefix).await?;
            if keys.is_empty() {
                println!("No objects found");
            } else {
                let rows: Vec<KeyRow> = keys.into_iter().map(|key| KeyRow { key }).collect();
                println!("{}", Table::new(rows));
            }
        }
        ObjectCommands::Prefixes {
            bucket,
            prefix,
            delimiter,
        } => {
            let prefixes = store.list_common_prefixes(&bucket, &prefix, &delimiter).await?;
            if prefixes.is_empty() {
                println!("No prefixes found");
            } else {
                let rows: Vec<PrefixRow> = prefixes.into_iter().map(|prefix| PrefixRow { prefix }).collect();
                println!("{}", Table::new(rows));
            }
        }
        ObjectCommands::Delete { bucket, key } => {
            store.delete_object(&bucket, &key).await?;
            println!("✓ Deleted {bucket}/{key}");
        }
        ObjectCommands::Sign { bucket, key, ttl } => {
            let url = store
                .create_signed_url(&bucket, &key, Duration::from_secs(ttl))
                .await?;
            println!("{url}");
        }
    }

    Ok(())
}

async fn run_volumes(command: VolumeCommands, config: &HashMap<String, String>) -> Result<(), anyhow::Error> {
    let snapshotter = snapshotter(config).await?;

    match command {
        VolumeCommands::Info { volume_id, zone } => {
            let (category, iops) = snapshotter.get_volume_info(&volume_id, &zone).await?;
            let row = VolumeRow {
                volume_id,
                category,
                iops: iops.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string()),
            };
            println!("{}", Table::new(vec![row]));
        }
        VolumeCommands::Restore {
            snapshot_id,
            volume_type,
            zone,
            iops,
        } => {
            let volume_id = snapshotter
                .create_volume_from_snapshot(&snapshot_id, &volume_type, &zone, iops)
                .await?;
            println!("{volume_id}");
        }
    }

    Ok(())
}

async fn run_snapshots(command: SnapshotCommands, config: &HashMap<String, String>) -> Result<(), anyhow::Error> {
    let snapshotter = snapshotter(config).await?;

    match command {
        SnapshotCommands::Create { volume_id, zone, tags } => {
            let tags: HashMap<String, String> = tags.into_iter().collect();
            let snapshot_id = snapshotter.create_snapshot(&volume_id, &zone, &tags).await?;
            println!("{snapshot_id}");
        }
        SnapshotCommands::Delete { snapshot_id } => {
            snapshotter.delete_snapshot(&snapshot_id).await?;
            println!("✓ Snapshot {snapshot_id} deleted");
        }
    }

    Ok(())
}

fn resolve_zone(origin: Option<&str>, current: &str, supported: Vec<String>) {
    let supported: BTreeSet<String> = supported
        .into_iter()
        .map(|zone| zone.trim().to_string())
        .filter(|zone| !zone.is_empty())
        .collect();

    let zone = determine_zone(origin, current, &supported);
    if zone.is_empty() {
        warn!("No zone could be determined");
    }
    println!("{zone}");
}

async fn mutate_manifest(file: &Path) -> Result<(), anyhow::Error> {
    let raw = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let item: serde_json::Value =
        serde_json::from_slice(&raw).with_context(|| format!("{} is not valid JSON", file.display()))?;

    let mutator = RestoreItemMutator::new(&PluginContext::from_process()?);
    let mutated = mutator.mutate(item).await?;
    println!("{}", serde_json::to_string_pretty(&mutated)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("region=cn-beijing").unwrap(),
            ("region".to_string(), "cn-beijing".to_string())
        );
        assert_eq!(
            parse_key_val("endpoint=https://a.example/?x=1").unwrap(),
            ("endpoint".to_string(), "https://a.example/?x=1".to_string())
        );
        assert!(parse_key_val("region").is_err());
        assert!(parse_key_val("=value").is_err());
    }

    #[test]
    fn test_cli_parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "alibackup",
            "-c",
            "region=cn-beijing",
            "snapshots",
            "create",
            "d-123",
            "--tag",
            "app=mysql",
            "--tag",
            "tier=db",
        ])
        .unwrap();

        assert_eq!(cli.config, vec![("region".to_string(), "cn-beijing".to_string())]);
        match cli.command {
            Commands::Snapshots(SnapshotCommands::Create { volume_id, tags, .. }) => {
                assert_eq!(volume_id, "d-123");
                assert_eq!(tags.len(), 2);
            }
            _ => panic!("expected snapshots create"),
        }
    }

    #[test]
    fn test_zone_resolve_splits_supported_list() {
        let cli = Cli::try_parse_from([
            "alibackup",
            "zone",
            "resolve",
            "--origin",
            "cn-beijing-l",
            "--current",
            "cn-beijing-k",
            "--supported",
            "cn-beijing-l,cn-beijing-k",
        ])
        .unwrap();

        match cli.command {
            Commands::Zone(ZoneCommands::Resolve { supported, .. }) => {
                assert_eq!(supported, vec!["cn-beijing-l", "cn-beijing-k"]);
            }
            _ => panic!("expected zone resolve"),
        }
    }
}
