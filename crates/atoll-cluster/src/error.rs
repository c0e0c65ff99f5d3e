//! Error types for the cluster crate.

/// Errors produced by membership, partition-table and topology components.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The persisted cluster shape disagrees with the configuration.
    #[error(
        "cluster shape changed: persisted {persisted_name}/{persisted_partitions} partitions, \
         configured {configured_name}/{configured_partitions} partitions"
    )]
    ShapeChanged {
        /// Cluster name found in the meta store.
        persisted_name: String,
        /// Partition count found in the meta store.
        persisted_partitions: u32,
        /// Cluster name from the configuration.
        configured_name: String,
        /// Partition count from the configuration.
        configured_partitions: u32,
    },

    /// A partition number outside `[0, partition_count)`.
    #[error("partition {partition} out of range (partition count {count})")]
    PartitionOutOfRange {
        /// Requested partition.
        partition: u32,
        /// Configured partition count.
        count: u32,
    },

    /// A subview merge was requested with no non-empty subview.
    #[error("no subviews to merge")]
    NoSubviews,

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Placement failure.
    #[error("placement error: {0}")]
    Placement(#[from] atoll_placement::PlacementError),

    /// An error from the metadata store.
    #[error("meta store error: {0}")]
    Meta(#[from] atoll_meta::MetaError),
}

impl From<postcard::Error> for ClusterError {
    fn from(err: postcard::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}
