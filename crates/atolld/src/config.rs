//! TOML configuration for the atoll daemon.
//!
//! Every field has a default, so an empty file (or no file) is valid. Flags
//! and environment variables given on the command line override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use atoll_cluster::{
    ClusterConfig, DEFAULT_BACKUP_COUNT, DEFAULT_PARTITION_COUNT, DEFAULT_RETENTION_COUNT,
};
use atoll_types::NodeRole;
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node identity and storage.
    pub node: NodeSection,
    /// Cluster shape and join settings.
    pub cluster: ClusterSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for persistent data (metadata DB).
    pub data_dir: PathBuf,
    /// `"worker"` or `"client"`.
    pub role: String,
    /// Relative capacity; heavier nodes are preferred as coordinator.
    pub power_weight: f64,
    /// Failure domain; nodes sharing a rack avoid holding the same partition.
    pub rack: Option<String>,
    /// Key under which the node id is persisted. Defaults to `host:data_dir`.
    pub instance_key: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".atoll"))
            .unwrap_or_else(|| PathBuf::from(".atoll"));
        Self {
            data_dir,
            role: "worker".to_string(),
            power_weight: 1.0,
            rack: None,
            instance_key: None,
        }
    }
}

/// `[cluster]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Cluster name; nodes only join clusters of the same name.
    pub name: String,
    /// Fixed number of partitions. Cannot change once persisted.
    pub partitions: u32,
    /// Backups per partition.
    pub backups: u32,
    /// Number of views kept in the topology history.
    pub retention: usize,
    /// Shared secret signing join tokens.
    ///
    /// If empty, a random secret is generated at startup and logged.
    pub secret: String,
    /// Seconds to wait for the coordinator's topology on join.
    pub join_timeout_secs: u64,
    /// Capacity of the membership event queue.
    pub event_queue_capacity: usize,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            name: "atoll".to_string(),
            partitions: DEFAULT_PARTITION_COUNT,
            backups: DEFAULT_BACKUP_COUNT,
            retention: DEFAULT_RETENTION_COUNT,
            secret: String::new(),
            join_timeout_secs: 10,
            event_queue_capacity: 1024,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("cannot read {}", p.display()))?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Parsed node role.
    pub fn role(&self) -> anyhow::Result<NodeRole> {
        match self.node.role.trim().to_ascii_lowercase().as_str() {
            "worker" => Ok(NodeRole::Worker),
            "client" => Ok(NodeRole::Client),
            other => bail!("unknown node role {other:?} (expected \"worker\" or \"client\")"),
        }
    }

    /// Path of the metadata database.
    pub fn meta_path(&self) -> PathBuf {
        self.node.data_dir.join("meta")
    }

    /// Build the library configuration.
    ///
    /// Fails if no secret is set; callers generate one first if desired.
    pub fn cluster_config(&self) -> anyhow::Result<ClusterConfig> {
        if self.cluster.secret.is_empty() {
            bail!("no cluster secret configured");
        }
        let config = ClusterConfig {
            retention_count: self.cluster.retention,
            event_queue_capacity: self.cluster.event_queue_capacity,
            ..ClusterConfig::new(&self.cluster.name, self.cluster.secret.as_bytes().to_vec())
        }
        .with_partition_count(self.cluster.partitions)
        .with_backup_count(self.cluster.backups)
        .with_join_sync_timeout(Duration::from_secs(self.cluster.join_timeout_secs));
        config.validate().context("invalid cluster configuration")?;
        Ok(config)
    }
}
