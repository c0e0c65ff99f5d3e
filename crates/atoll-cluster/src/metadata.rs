//! Partition table maintenance.
//!
//! [`ClusterMetadata`] owns the partition → nodes table. Readers load an
//! immutable [`PartitionTable`] snapshot through an [`ArcSwap`] and never
//! block; the single writer recomputes the whole table under a mutex and
//! swaps it in atomically, so no reader ever sees a half-updated table.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use atoll_placement::{Neighborhoods, PartitionMapper};
use atoll_types::{NodeId, NodeIdentity, View, ViewId};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::{ClusterConfig, ClusterError};

/// Computes per-view neighborhoods for placement (e.g. grouping by rack).
pub type NeighborhoodSource = Arc<dyn Fn(&View) -> Neighborhoods + Send + Sync>;

/// Hash a key to 32 bits: the first four bytes (LE) of its BLAKE3 digest.
///
/// Identical on every node, so all members map a key to the same partition.
pub fn hash_key(key: &[u8]) -> u32 {
    let digest = blake3::hash(key);
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// One partition and its owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Partition number in `[0, partition_count)`.
    pub number: u32,
    /// Owners: index 0 is the primary, the rest are backups.
    pub nodes: Vec<NodeIdentity>,
}

impl Partition {
    /// The primary owner, if any node is assigned.
    pub fn primary(&self) -> Option<&NodeIdentity> {
        self.nodes.first()
    }

    /// The backup owners in preference order.
    pub fn backups(&self) -> &[NodeIdentity] {
        self.nodes.get(1..).unwrap_or_default()
    }

    fn owner_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|n| n.id)
    }
}

/// Immutable snapshot of the whole partition table.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    view_id: ViewId,
    partitions: Vec<Partition>,
}

impl PartitionTable {
    fn unassigned(partition_count: u32) -> Self {
        Self {
            view_id: ViewId::EMPTY,
            partitions: (0..partition_count)
                .map(|number| Partition {
                    number,
                    nodes: Vec::new(),
                })
                .collect(),
        }
    }

    /// The view this table was computed for.
    pub fn view_id(&self) -> ViewId {
        self.view_id
    }

    /// All partitions, indexed by number.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Whether the table has no partitions (never true for a valid config).
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Look up one partition.
    pub fn get(&self, partition: u32) -> Option<&Partition> {
        self.partitions.get(partition as usize)
    }
}

/// Result of a repartition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDelta {
    /// View the table now reflects.
    pub view_id: ViewId,
    /// View the table reflected before.
    pub previous_view_id: ViewId,
    /// Partitions whose owner list changed, ascending.
    pub changed: Vec<u32>,
}

/// Applies view transitions to a partition table.
///
/// Implemented by [`ClusterMetadata`]; the dispatcher depends only on this
/// trait.
pub trait MetadataUpdater: Send + Sync {
    /// Recompute the table for the transition `old` → `new`.
    fn update(&self, old: &View, new: &View) -> Result<PartitionDelta, ClusterError>;
}

/// The partition table of one node.
pub struct ClusterMetadata {
    partition_count: u32,
    backup_count: u32,
    /// `partition_count - 1` when the count is a power of two.
    mask: Option<u32>,
    mapper: PartitionMapper,
    neighborhoods: Option<NeighborhoodSource>,
    table: ArcSwap<PartitionTable>,
    write_lock: Mutex<()>,
}

impl ClusterMetadata {
    /// Create an unassigned table of `partition_count` partitions.
    pub fn new(
        partition_count: u32,
        backup_count: u32,
        mapper: PartitionMapper,
    ) -> Result<Self, ClusterError> {
        if partition_count == 0 {
            return Err(ClusterError::Config("partition_count must be at least 1".into()));
        }
        let mask = partition_count
            .is_power_of_two()
            .then(|| partition_count - 1);
        Ok(Self {
            partition_count,
            backup_count,
            mask,
            mapper,
            neighborhoods: None,
            table: ArcSwap::from_pointee(PartitionTable::unassigned(partition_count)),
            write_lock: Mutex::new(()),
        })
    }

    /// Create a table from the cluster configuration with a default mapper.
    pub fn from_config(config: &ClusterConfig) -> Result<Self, ClusterError> {
        Self::new(
            config.partition_count,
            config.backup_count,
            PartitionMapper::new(),
        )
    }

    /// Install a neighborhood source consulted on every repartition.
    pub fn with_neighborhoods(
        mut self,
        source: impl Fn(&View) -> Neighborhoods + Send + Sync + 'static,
    ) -> Self {
        self.neighborhoods = Some(Arc::new(source));
        self
    }

    /// Fixed number of partitions.
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Requested backups per partition.
    pub fn backup_count(&self) -> u32 {
        self.backup_count
    }

    /// The view the current table reflects.
    pub fn view_id(&self) -> ViewId {
        self.table.load().view_id
    }

    /// Load the current table snapshot.
    pub fn snapshot(&self) -> Arc<PartitionTable> {
        self.table.load_full()
    }

    /// Return a copy of one partition.
    pub fn lookup(&self, partition: u32) -> Result<Partition, ClusterError> {
        self.check_range(partition)?;
        let table = self.table.load();
        table
            .get(partition)
            .cloned()
            .ok_or(ClusterError::PartitionOutOfRange {
                partition,
                count: self.partition_count,
            })
    }

    /// Owners of a partition, primary first.
    pub fn nodes_for_partition(&self, partition: u32) -> Result<Vec<NodeIdentity>, ClusterError> {
        Ok(self.lookup(partition)?.nodes)
    }

    /// Primary owner of a partition, `None` before the first view.
    pub fn primary_for_partition(
        &self,
        partition: u32,
    ) -> Result<Option<NodeIdentity>, ClusterError> {
        Ok(self.lookup(partition)?.nodes.into_iter().next())
    }

    /// Map a key to its partition.
    pub fn partition_for_key(&self, key: &[u8]) -> u32 {
        let h = hash_key(key);
        match self.mask {
            Some(mask) => (h ^ (h >> 16)) & mask,
            None => h % self.partition_count,
        }
    }

    /// Partitions for which `node` is primary.
    pub fn primary_partitions(&self, node: &NodeId) -> Vec<u32> {
        self.table
            .load()
            .partitions
            .iter()
            .filter(|p| p.primary().is_some_and(|n| &n.id == node))
            .map(|p| p.number)
            .collect()
    }

    /// Partitions for which `node` is a backup.
    pub fn backup_partitions(&self, node: &NodeId) -> Vec<u32> {
        self.table
            .load()
            .partitions
            .iter()
            .filter(|p| p.backups().iter().any(|n| &n.id == node))
            .map(|p| p.number)
            .collect()
    }

    fn check_range(&self, partition: u32) -> Result<(), ClusterError> {
        if partition >= self.partition_count {
            return Err(ClusterError::PartitionOutOfRange {
                partition,
                count: self.partition_count,
            });
        }
        Ok(())
    }

    fn compute(&self, view: &View) -> Result<Vec<Partition>, ClusterError> {
        let members = view.members();
        if members.is_empty() {
            return Ok(PartitionTable::unassigned(self.partition_count).partitions);
        }

        let hoods = self.neighborhoods.as_ref().map(|source| source(view));
        let backups = self.backup_count as usize;
        let partitions = (0..self.partition_count)
            .into_par_iter()
            .map(|number| -> Result<Partition, ClusterError> {
                let nodes = self
                    .mapper
                    .allocate(number, backups, members, hoods.as_ref())?;
                Ok(Partition { number, nodes })
            })
            .collect::<Result<Vec<_>, ClusterError>>()?;
        Ok(partitions)
    }
}

impl MetadataUpdater for ClusterMetadata {
    fn update(&self, old: &View, new: &View) -> Result<PartitionDelta, ClusterError> {
        let _guard = self.write_lock.lock().expect("metadata lock poisoned");
        let current = self.table.load_full();

        if current.view_id != old.id() {
            warn!(
                expected = %current.view_id,
                got = %old.id(),
                "repartition predecessor differs from current table"
            );
        }

        if old.is_empty_view() {
            info!(
                view_id = %new.id(),
                members = new.len(),
                partitions = self.partition_count,
                "computing initial partition table"
            );
        } else {
            let diff = View::diff(old, new);
            debug!(
                view_id = %new.id(),
                joined = diff.joined.len(),
                left = diff.left.len(),
                "recomputing partition table"
            );
        }

        let partitions = self.compute(new)?;
        let changed: Vec<u32> = partitions
            .iter()
            .zip(current.partitions.iter())
            .filter(|(next, prev)| !next.owner_ids().eq(prev.owner_ids()))
            .map(|(next, _)| next.number)
            .collect();

        self.table.store(Arc::new(PartitionTable {
            view_id: new.id(),
            partitions,
        }));

        debug!(
            view_id = %new.id(),
            changed = changed.len(),
            "partition table updated"
        );
        Ok(PartitionDelta {
            view_id: new.id(),
            previous_view_id: current.view_id,
            changed,
        })
    }
}

impl std::fmt::Debug for ClusterMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMetadata")
            .field("partition_count", &self.partition_count)
            .field("backup_count", &self.backup_count)
            .field("view_id", &self.view_id())
            .finish_non_exhaustive()
    }
}
