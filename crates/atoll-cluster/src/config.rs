//! Cluster configuration.

use std::time::Duration;

use atoll_types::ClusterShape;

use crate::ClusterError;

/// Default partition count (a prime keeps keys spread for non-power-of-two hashing).
pub const DEFAULT_PARTITION_COUNT: u32 = 271;
/// Default number of backups per partition.
pub const DEFAULT_BACKUP_COUNT: u32 = 1;
/// Default number of retained topology views.
pub const DEFAULT_RETENTION_COUNT: usize = 5;

/// Configuration shared by every node of a cluster.
///
/// `cluster_name`, `partition_count` and `shared_auth_key` must be identical
/// on all members; join tokens carry the first two (plus `backup_count`) so
/// mismatched nodes are refused at handshake time.
#[derive(Clone)]
pub struct ClusterConfig {
    /// Name of the cluster to join.
    pub cluster_name: String,
    /// Fixed number of logical partitions.
    pub partition_count: u32,
    /// Backups per partition. Clamped to `members - 1` at placement time.
    pub backup_count: u32,
    /// How many views the topology history keeps.
    pub retention_count: usize,
    /// How long a joiner waits for the coordinator's topology snapshot.
    pub join_sync_timeout: Duration,
    /// Symmetric key used to sign join tokens.
    pub shared_auth_key: Vec<u8>,
    /// Capacity of the dispatcher's inbound event queue.
    pub event_queue_capacity: usize,
    /// Upper bound on draining queued events at shutdown.
    pub shutdown_timeout: Duration,
}

impl ClusterConfig {
    /// Create a config with default tuning for the given cluster and key.
    pub fn new(cluster_name: impl Into<String>, shared_auth_key: impl Into<Vec<u8>>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            partition_count: DEFAULT_PARTITION_COUNT,
            backup_count: DEFAULT_BACKUP_COUNT,
            retention_count: DEFAULT_RETENTION_COUNT,
            join_sync_timeout: Duration::from_secs(10),
            shared_auth_key: shared_auth_key.into(),
            event_queue_capacity: 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            partition_count: 16,
            join_sync_timeout: Duration::from_secs(2),
            event_queue_capacity: 64,
            shutdown_timeout: Duration::from_millis(500),
            ..Self::new("atoll-test", b"test-secret".to_vec())
        }
    }

    /// Set the partition count.
    pub fn with_partition_count(mut self, partition_count: u32) -> Self {
        self.partition_count = partition_count;
        self
    }

    /// Set the backup count.
    pub fn with_backup_count(mut self, backup_count: u32) -> Self {
        self.backup_count = backup_count;
        self
    }

    /// Set the topology retention count.
    pub fn with_retention_count(mut self, retention_count: usize) -> Self {
        self.retention_count = retention_count;
        self
    }

    /// Set the join sync timeout.
    pub fn with_join_sync_timeout(mut self, timeout: Duration) -> Self {
        self.join_sync_timeout = timeout;
        self
    }

    /// Check every value, returning [`ClusterError::Config`] on the first violation.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.cluster_name.trim().is_empty() {
            return Err(ClusterError::Config("cluster_name must not be empty".into()));
        }
        if self.partition_count == 0 {
            return Err(ClusterError::Config("partition_count must be at least 1".into()));
        }
        if self.retention_count == 0 {
            return Err(ClusterError::Config("retention_count must be at least 1".into()));
        }
        if self.shared_auth_key.is_empty() {
            return Err(ClusterError::Config("shared_auth_key must not be empty".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(ClusterError::Config(
                "event_queue_capacity must be at least 1".into(),
            ));
        }
        if self.join_sync_timeout.is_zero() {
            return Err(ClusterError::Config("join_sync_timeout must be positive".into()));
        }
        if !self.partition_count.is_power_of_two() {
            tracing::debug!(
                partition_count = self.partition_count,
                "partition count is not a power of two, key mapping uses modulo"
            );
        }
        Ok(())
    }

    /// The parameters persisted and compared across restarts.
    pub fn shape(&self) -> ClusterShape {
        ClusterShape {
            cluster_name: self.cluster_name.clone(),
            partition_count: self.partition_count,
            backup_count: self.backup_count,
        }
    }
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("cluster_name", &self.cluster_name)
            .field("partition_count", &self.partition_count)
            .field("backup_count", &self.backup_count)
            .field("retention_count", &self.retention_count)
            .field("join_sync_timeout", &self.join_sync_timeout)
            .field("shared_auth_key", &"<redacted>")
            .field("event_queue_capacity", &self.event_queue_capacity)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}
