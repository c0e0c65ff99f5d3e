//! Membership ordering and coordinator election.
//!
//! The transport installs a [`MembershipPolicy`] and consults it whenever it
//! has to decide the order of members in a new view. Element 0 of the result
//! is the coordinator. The policy never touches partitions.

use std::cmp::Ordering;
use std::collections::HashSet;

use atoll_types::{NodeId, NodeIdentity};
use tracing::debug;

use crate::ClusterError;

/// Strategy for ordering members in a new view.
pub trait MembershipPolicy: Send + Sync {
    /// Compute the next member list from the current one.
    ///
    /// Leavers and suspects are removed, joiners appended, then the list is
    /// ordered so that element 0 is the coordinator.
    fn reconcile(
        &self,
        current: &[NodeIdentity],
        joiners: &[NodeIdentity],
        leavers: &[NodeId],
        suspects: &[NodeId],
    ) -> Vec<NodeIdentity>;

    /// Merge the member lists of subviews after a network partition heals.
    fn merge(&self, subviews: &[Vec<NodeIdentity>]) -> Result<Vec<NodeIdentity>, ClusterError>;
}

/// Orders by descending power weight, then descending role rank, then
/// ascending node id.
///
/// "Less" means "more suitable as coordinator", so sorting ascending puts the
/// best candidate first.
pub fn compare_members(a: &NodeIdentity, b: &NodeIdentity) -> Ordering {
    b.power_weight()
        .total_cmp(&a.power_weight())
        .then_with(|| b.role.rank().cmp(&a.role.rank()))
        .then_with(|| a.id.cmp(&b.id))
}

/// Default policy: pin the surviving coordinator, otherwise elect the best
/// member by [`compare_members`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMembershipPolicy;

impl MembershipPolicy for DefaultMembershipPolicy {
    fn reconcile(
        &self,
        current: &[NodeIdentity],
        joiners: &[NodeIdentity],
        leavers: &[NodeId],
        suspects: &[NodeId],
    ) -> Vec<NodeIdentity> {
        let removed: HashSet<&NodeId> = leavers.iter().chain(suspects).collect();
        let mut seen: HashSet<NodeId> = HashSet::new();

        let mut members: Vec<NodeIdentity> = current
            .iter()
            .chain(joiners)
            .filter(|m| !removed.contains(&m.id) && seen.insert(m.id))
            .cloned()
            .collect();

        let coordinator = current.first().map(|c| c.id);
        match coordinator {
            Some(id) if members.first().is_some_and(|m| m.id == id) => {
                members[1..].sort_by(compare_members);
            }
            _ => {
                members.sort_by(compare_members);
                if let Some(elected) = members.first() {
                    debug!(coordinator = %elected, "elected new coordinator");
                }
            }
        }
        members
    }

    fn merge(&self, subviews: &[Vec<NodeIdentity>]) -> Result<Vec<NodeIdentity>, ClusterError> {
        let coordinator = subviews
            .iter()
            .filter_map(|sub| sub.first())
            .min_by(|a, b| compare_members(a, b))
            .ok_or(ClusterError::NoSubviews)?;

        let mut seen: HashSet<NodeId> = HashSet::new();
        seen.insert(coordinator.id);
        let mut merged = vec![coordinator.clone()];
        for member in subviews.iter().flatten() {
            if seen.insert(member.id) {
                merged.push(member.clone());
            }
        }

        debug!(
            coordinator = %coordinator,
            subviews = subviews.len(),
            members = merged.len(),
            "merged subviews"
        );
        Ok(merged)
    }
}
