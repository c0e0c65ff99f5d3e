//! `atolld`: the atoll daemon.
//!
//! Runs a cluster node and offers a few operator commands over its local
//! metadata store.
//!
//! # Usage
//!
//! ```text
//! atolld start                                 # start the node
//! atolld start -c atoll.toml                   # start with a config file
//! atolld start -d ./node2 --cluster staging    # second instance
//! atolld status                                # identity, shape, view history
//! atolld placement --nodes 5 --partitions 64   # simulate a partition table
//! ```

mod config;
mod telemetry;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use atoll_cluster::{
    ClusterMetadata, IdentityGenerator, MetadataUpdater, default_instance_key, detect_host_name,
};
use atoll_engine::{ClusterNode, LocalNetwork};
use atoll_meta::MetaStore;
use atoll_placement::{Neighborhoods, PartitionMapper};
use atoll_types::{HybridClock, MembershipEvent, NodeId, NodeIdentity, NodeRole, View, ViewId};
use clap::{Parser, Subcommand};
use rand::Rng;
use tracing::{error, info, warn};

use config::CliConfig;

/// Attribute carrying a node's failure domain.
const RACK_ATTR: &str = "rack";

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "atolld",
    version,
    about = "atoll cluster membership and partitioning daemon"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node.
    Start {
        /// Override data directory (useful for running multiple instances).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Override the cluster name.
        #[arg(long)]
        cluster: Option<String>,

        /// Shared secret for join tokens (nodes must share the same secret).
        ///
        /// If none is provided, a random secret is generated and displayed.
        #[arg(long, env = "ATOLL_SECRET")]
        secret: Option<String>,

        /// Run fully in-memory (no disk persistence).
        #[arg(short, long)]
        memory: bool,
    },

    /// Show identity, cluster shape and view history from the local store.
    Status {
        /// Override data directory.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Simulate partition placement over synthetic nodes.
    Placement {
        /// Number of nodes.
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Number of partitions (defaults to the configured count).
        #[arg(short, long)]
        partitions: Option<u32>,

        /// Backups per partition (defaults to the configured count).
        #[arg(short, long)]
        backups: Option<u32>,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Start {
            data_dir,
            cluster,
            secret,
            memory,
        } => {
            // CLI args override config file values.
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if let Some(name) = cluster {
                config.cluster.name = name;
            }
            if let Some(s) = secret {
                config.cluster.secret = s;
            }
            cmd_start(config, memory).await
        }
        Commands::Status { data_dir } => {
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            cmd_status(&config)
        }
        Commands::Placement {
            nodes,
            partitions,
            backups,
        } => cmd_placement(
            nodes,
            partitions.unwrap_or(config.cluster.partitions),
            backups.unwrap_or(config.cluster.backups),
        ),
    }
}

// -----------------------------------------------------------------------
// atolld start
// -----------------------------------------------------------------------

async fn cmd_start(mut config: CliConfig, memory: bool) -> Result<()> {
    info!(
        data_dir = %config.node.data_dir.display(),
        cluster = %config.cluster.name,
        partitions = config.cluster.partitions,
        backups = config.cluster.backups,
        memory,
        "starting atolld"
    );

    if config.cluster.secret.is_empty() {
        config.cluster.secret = generate_secret();
        info!("cluster secret (generated): {}", config.cluster.secret);
    }
    let cluster_config = config.cluster_config()?;

    let meta = if memory {
        MetaStore::open_temporary().context("failed to create in-memory store")?
    } else {
        std::fs::create_dir_all(&config.node.data_dir)
            .context("failed to create data directory")?;
        MetaStore::open(config.meta_path()).context("failed to open metadata store")?
    };
    let meta = Arc::new(meta);

    let mut template = IdentityGenerator::template(config.role()?, config.node.power_weight);
    if let Some(rack) = &config.node.rack {
        template = template.with_attribute(RACK_ATTR, rack.as_bytes().to_vec());
    }
    let instance_key = config
        .node
        .instance_key
        .clone()
        .unwrap_or_else(|| default_instance_key(&template.host, &config.node.data_dir));
    let identity = IdentityGenerator::load_or_create(&meta, &instance_key, template)
        .context("failed to load node identity")?;

    let network = LocalNetwork::new();
    let mut builder = ClusterNode::builder(cluster_config, identity).meta(meta);
    if config.node.rack.is_some() {
        builder = builder.neighborhoods(Arc::new(|view: &View| {
            Neighborhoods::from_attribute(view.members(), RACK_ATTR)
        }));
    }
    let node = builder
        .start(network.channel())
        .await
        .context("failed to start cluster node")?;

    let local = node.local_identity().id;
    info!(
        node_id = %local,
        view_id = %node.current_view().id(),
        coordinator = node.is_coordinator(),
        primaries = node.metadata().primary_partitions(&local).len(),
        backups = node.metadata().backup_partitions(&local).len(),
        "node running"
    );

    let events = node.on_membership_event(|event| async move {
        match event {
            MembershipEvent::ViewChanged {
                view, joined, left, ..
            } => info!(
                view_id = %view.id(),
                members = view.len(),
                joined = joined.len(),
                left = left.len(),
                "membership changed"
            ),
            MembershipEvent::ChannelClosed { node_id } => {
                warn!(%node_id, "transport channel closed")
            }
            MembershipEvent::Joined { .. } | MembershipEvent::Left { .. } => {}
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("received ctrl-c, shutting down");

    node.shutdown().await.context("shutdown failed")?;
    if let Err(e) = events.await {
        warn!(error = %e, "membership log task failed");
    }
    Ok(())
}

/// Random 32-character hex secret.
fn generate_secret() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// -----------------------------------------------------------------------
// atolld status
// -----------------------------------------------------------------------

fn cmd_status(config: &CliConfig) -> Result<()> {
    let meta_path = config.meta_path();

    let meta = MetaStore::open(&meta_path).map_err(|e| {
        error!(path = %meta_path.display(), %e, "failed to open metadata store");
        anyhow::anyhow!(
            "cannot open metadata at {}. Is the node running? ({e})",
            meta_path.display(),
        )
    })?;

    let instance_key = config
        .node
        .instance_key
        .clone()
        .unwrap_or_else(|| default_instance_key(&detect_host_name(), &config.node.data_dir));
    match meta.get_identity(&instance_key)? {
        Some(identity) => println!(
            "Node: {} host={} role={} weight={}",
            identity.id,
            identity.host,
            identity.role,
            identity.power_weight()
        ),
        None => println!("Node: no identity stored under {instance_key:?}"),
    }

    match meta.get_shape()? {
        Some(shape) => println!(
            "Cluster: {} partitions={} backups={}",
            shape.cluster_name, shape.partition_count, shape.backup_count
        ),
        None => println!("Cluster: not yet started"),
    }

    let views = meta.list_views()?;
    println!("Views: {}", views.len());
    for view in views.iter().rev() {
        let coordinator = view
            .coordinator()
            .map(|c| c.id.short())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} members={} coordinator={}",
            view.id(),
            view.len(),
            coordinator
        );
    }

    Ok(())
}

// -----------------------------------------------------------------------
// atolld placement
// -----------------------------------------------------------------------

fn cmd_placement(nodes: usize, partitions: u32, backups: u32) -> Result<()> {
    anyhow::ensure!(nodes > 0, "--nodes must be at least 1");

    let members: Vec<NodeIdentity> = (0..nodes)
        .map(|i| {
            let name = format!("node-{i}");
            NodeIdentity::new(NodeId::from_data(name.as_bytes()), name, NodeRole::Worker)
        })
        .collect();
    let view = View::new(
        ViewId::new(HybridClock::new().tick(), members[0].id),
        members.clone(),
    );

    let metadata = ClusterMetadata::new(partitions, backups, PartitionMapper::new())?;
    metadata.update(&View::empty(), &view)?;

    println!("Placement: {nodes} nodes, {partitions} partitions, {backups} backups");
    let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for member in &members {
        counts.insert(
            member.host.clone(),
            (
                metadata.primary_partitions(&member.id).len(),
                metadata.backup_partitions(&member.id).len(),
            ),
        );
    }
    for (host, (primaries, backups)) in &counts {
        println!("  {host:<10} primaries={primaries:<6} backups={backups}");
    }

    Ok(())
}
