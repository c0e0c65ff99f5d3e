//! Rendezvous partition mapper.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use atoll_types::{NodeId, NodeIdentity};
use tracing::warn;

use crate::PlacementError;

/// Hard predicate on `(primary, candidate)`: return `false` to forbid the
/// candidate as a backup of that primary.
pub type BackupFilter = Arc<dyn Fn(&NodeIdentity, &NodeIdentity) -> bool + Send + Sync>;

/// Hard predicate on `(candidate, already_chosen)`: return `false` to forbid
/// the candidate given the nodes picked so far.
pub type AffinityFilter = Arc<dyn Fn(&NodeIdentity, &[&NodeIdentity]) -> bool + Send + Sync>;

/// Wang/Jenkins 64-bit avalanche mix.
pub fn mix64(mut key: u64) -> u64 {
    key = (!key).wrapping_add(key << 21);
    key ^= key >> 24;
    key = key.wrapping_add(key << 3).wrapping_add(key << 8);
    key ^= key >> 14;
    key = key.wrapping_add(key << 2).wrapping_add(key << 4);
    key ^= key >> 28;
    key.wrapping_add(key << 31)
}

/// Rendezvous weight of `node` for `partition`.
///
/// Packs the node's 32-bit hash into the high half and the partition number
/// into the low half, then mixes.
pub fn weight(node: &NodeId, partition: u32) -> u64 {
    mix64((u64::from(node.hash32()) << 32) | u64::from(partition))
}

/// Declared failure-domain neighborhoods.
///
/// A candidate is *covered* when some already-chosen node lists it as a
/// neighbor; covered candidates are skipped so that replicas of a partition
/// land in different failure domains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Neighborhoods {
    declared: HashMap<NodeId, HashSet<NodeId>>,
}

impl Neighborhoods {
    /// Create an empty set of neighborhoods (nothing is covered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `neighbors` as sharing a failure domain with `node`.
    pub fn declare(&mut self, node: NodeId, neighbors: impl IntoIterator<Item = NodeId>) {
        self.declared
            .entry(node)
            .or_default()
            .extend(neighbors.into_iter().filter(|n| *n != node));
    }

    /// Group nodes by the value of attribute `key` (e.g. `"rack"`).
    ///
    /// Nodes sharing a value are each other's neighbors. Nodes without the
    /// attribute have no neighbors.
    pub fn from_attribute(nodes: &[NodeIdentity], key: &str) -> Self {
        let mut groups: HashMap<&[u8], Vec<NodeId>> = HashMap::new();
        for node in nodes {
            if let Some(value) = node.attributes.get(key) {
                groups.entry(value.as_slice()).or_default().push(node.id);
            }
        }

        let mut neighborhoods = Self::new();
        for members in groups.values() {
            for id in members {
                neighborhoods.declare(*id, members.iter().copied());
            }
        }
        neighborhoods
    }

    /// The declared neighbors of `node`.
    pub fn neighbors_of(&self, node: &NodeId) -> Option<&HashSet<NodeId>> {
        self.declared.get(node)
    }

    /// Whether any node in `chosen` declares `candidate` as a neighbor.
    pub fn covers(&self, chosen: &[&NodeIdentity], candidate: &NodeId) -> bool {
        chosen.iter().any(|c| {
            self.declared
                .get(&c.id)
                .is_some_and(|set| set.contains(candidate))
        })
    }

    /// Whether no neighborhoods are declared.
    pub fn is_empty(&self) -> bool {
        self.declared.values().all(HashSet::is_empty)
    }
}

/// Maps partitions to ordered `[primary, backup...]` node lists.
///
/// Stateless apart from its predicates; safe to share across threads and
/// call concurrently for different partitions.
#[derive(Clone, Default)]
pub struct PartitionMapper {
    backup_filter: Option<BackupFilter>,
    affinity: Option<AffinityFilter>,
}

impl PartitionMapper {
    /// Create a mapper with no placement predicates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a backup-exclusion predicate.
    pub fn with_backup_filter(
        mut self,
        filter: impl Fn(&NodeIdentity, &NodeIdentity) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.backup_filter = Some(Arc::new(filter));
        self
    }

    /// Install an affinity predicate.
    pub fn with_affinity(
        mut self,
        filter: impl Fn(&NodeIdentity, &[&NodeIdentity]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.affinity = Some(Arc::new(filter));
        self
    }

    /// Rank candidates for `partition`: descending weight, ties broken by
    /// ascending node id. Duplicate ids are collapsed.
    ///
    /// The result does not depend on the order of `candidates`.
    pub fn rank<'a>(partition: u32, candidates: &'a [NodeIdentity]) -> Vec<(u64, &'a NodeIdentity)> {
        let mut scored: Vec<(u64, &NodeIdentity)> = candidates
            .iter()
            .map(|node| (weight(&node.id, partition), node))
            .collect();
        scored.sort_by(|(wa, a), (wb, b)| wb.cmp(wa).then_with(|| a.id.cmp(&b.id)));
        scored.dedup_by_key(|(_, node)| node.id);
        scored
    }

    /// Compute the owners of `partition`: primary first, then up to
    /// `backup_count` backups by descending weight.
    ///
    /// Returns fewer than `backup_count + 1` nodes when there are not enough
    /// candidates or the predicates reject some of them. If `neighborhoods`
    /// over-constrains placement, placement is retried once without it.
    pub fn allocate(
        &self,
        partition: u32,
        backup_count: usize,
        candidates: &[NodeIdentity],
        neighborhoods: Option<&Neighborhoods>,
    ) -> Result<Vec<NodeIdentity>, PlacementError> {
        if candidates.is_empty() {
            return Err(PlacementError::NoCandidates { partition });
        }

        let ranked = Self::rank(partition, candidates);
        let target = backup_count.saturating_add(1).min(ranked.len());

        let mut chosen = self.select(&ranked, target, neighborhoods);
        if chosen.len() < target && neighborhoods.is_some() {
            // Only worth dropping the exclusion if it was what held placement back.
            let relaxed = self.select(&ranked, target, None);
            if relaxed.len() > chosen.len() {
                warn!(
                    partition,
                    wanted = target,
                    strict = chosen.len(),
                    relaxed = relaxed.len(),
                    "neighborhood exclusion over-constrained placement, placed without it"
                );
                chosen = relaxed;
            }
        }

        if chosen.len() < backup_count.saturating_add(1) {
            warn!(
                partition,
                requested_backups = backup_count,
                candidates = ranked.len(),
                placed = chosen.len(),
                "placing partition with fewer backups than requested"
            );
        }

        Ok(chosen.into_iter().cloned().collect())
    }

    fn select<'a>(
        &self,
        ranked: &[(u64, &'a NodeIdentity)],
        target: usize,
        neighborhoods: Option<&Neighborhoods>,
    ) -> Vec<&'a NodeIdentity> {
        let mut chosen: Vec<&NodeIdentity> = Vec::with_capacity(target);
        let Some(&(_, primary)) = ranked.first() else {
            return chosen;
        };
        chosen.push(primary);

        for &(_, candidate) in &ranked[1..] {
            if chosen.len() >= target {
                break;
            }
            if let Some(filter) = &self.backup_filter
                && !filter(primary, candidate)
            {
                continue;
            }
            if let Some(affinity) = &self.affinity
                && !affinity(candidate, &chosen)
            {
                continue;
            }
            if let Some(hoods) = neighborhoods
                && hoods.covers(&chosen, &candidate.id)
            {
                continue;
            }
            chosen.push(candidate);
        }

        chosen
    }
}

impl fmt::Debug for PartitionMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionMapper")
            .field("backup_filter", &self.backup_filter.is_some())
            .field("affinity", &self.affinity.is_some())
            .finish()
    }
}
