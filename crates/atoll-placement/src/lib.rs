//! Weighted rendezvous (highest-random-weight) hashing for partition placement.
//!
//! Every `(node, partition)` pair gets a deterministic 64-bit weight computed
//! by a Wang/Jenkins avalanche mix of the node's 32-bit hash and the
//! partition number. The highest-weight node is the partition's primary and
//! the next ones (subject to placement predicates) are its backups.
//!
//! Because a node's weight for a partition does not depend on the other
//! candidates, adding or removing one node only moves the partitions that
//! node wins or loses. Independent nodes therefore agree on placement
//! without anyone broadcasting a table.

mod error;
mod rendezvous;

pub use error::PlacementError;
pub use rendezvous::{
    AffinityFilter, BackupFilter, Neighborhoods, PartitionMapper, mix64, weight,
};
