//! Bounded, persisted history of accepted membership views.
//!
//! [`TopologyHistory`] is the pure in-memory structure: views ordered newest
//! first by [`ViewId`], capped at a retention count. [`TopologyStore`] wraps
//! it with write-ahead persistence into the `topology` keyspace of a
//! [`MetaStore`] and recovers it on startup.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use atoll_meta::MetaStore;
use atoll_types::{HlcTimestamp, View, ViewId};
use tracing::{debug, error, info, warn};

use crate::ClusterError;

/// Ordered, bounded view history (newest first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyHistory {
    views: BTreeMap<Reverse<ViewId>, View>,
    retention: usize,
}

impl TopologyHistory {
    /// Create an empty history keeping at most `retention` views (minimum 1).
    pub fn new(retention: usize) -> Self {
        Self {
            views: BTreeMap::new(),
            retention: retention.max(1),
        }
    }

    /// Maximum number of retained views.
    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Insert a view, returning the ids evicted to respect the cap.
    ///
    /// Inserting a view older than every retained one into a full history
    /// evicts that view itself.
    pub fn insert(&mut self, view: View) -> Vec<ViewId> {
        self.views.insert(Reverse(view.id()), view);
        self.truncate()
    }

    /// Union with `other`, re-truncating to the cap.
    ///
    /// Idempotent, and commutative for disjoint inputs. Returns evicted ids.
    pub fn merge(&mut self, other: &TopologyHistory) -> Vec<ViewId> {
        for (key, view) in &other.views {
            self.views.entry(*key).or_insert_with(|| view.clone());
        }
        self.truncate()
    }

    fn truncate(&mut self) -> Vec<ViewId> {
        let mut evicted = Vec::new();
        while self.views.len() > self.retention {
            if let Some((Reverse(id), _)) = self.views.pop_last() {
                evicted.push(id);
            }
        }
        evicted
    }

    /// The newest view.
    pub fn latest(&self) -> Option<&View> {
        self.views.values().next()
    }

    /// The newest view whose timestamp is `<= ts`.
    pub fn as_of(&self, ts: HlcTimestamp) -> Option<&View> {
        self.views.values().find(|v| v.id().timestamp <= ts)
    }

    /// The oldest view whose timestamp is `>= ts`.
    pub fn earliest_since(&self, ts: HlcTimestamp) -> Option<&View> {
        self.views.values().rev().find(|v| v.id().timestamp >= ts)
    }

    /// Look up a view by id.
    pub fn get(&self, id: &ViewId) -> Option<&View> {
        self.views.get(&Reverse(*id))
    }

    /// Whether a view is retained.
    pub fn contains(&self, id: &ViewId) -> bool {
        self.views.contains_key(&Reverse(*id))
    }

    /// Iterate views newest first.
    pub fn iter(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    /// Number of retained views.
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Encode as a postcard list of views, newest first.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClusterError> {
        let views: Vec<&View> = self.views.values().collect();
        Ok(postcard::to_allocvec(&views)?)
    }

    /// Decode a list produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8], retention: usize) -> Result<Self, ClusterError> {
        let views: Vec<View> = postcard::from_bytes(bytes)?;
        let mut history = Self::new(retention);
        for view in views {
            history.insert(view);
        }
        Ok(history)
    }
}

/// Persisted topology history.
///
/// Writes go to the meta store first and are applied in memory under the
/// same lock, so a recovered history never lacks a view the node applied.
pub struct TopologyStore {
    history: Mutex<TopologyHistory>,
    meta: Option<Arc<MetaStore>>,
}

impl TopologyStore {
    /// Create a store that keeps history in memory only.
    pub fn in_memory(retention: usize) -> Self {
        Self {
            history: Mutex::new(TopologyHistory::new(retention)),
            meta: None,
        }
    }

    /// Open a persisted store, loading every stored view.
    ///
    /// Views beyond the retention cap are dropped from disk as well.
    pub fn open(meta: Arc<MetaStore>, retention: usize) -> Result<Self, ClusterError> {
        let mut history = TopologyHistory::new(retention);
        for view in meta.list_views()? {
            for id in history.insert(view) {
                meta.remove_view(&id)?;
            }
        }

        if let Some(latest) = history.latest() {
            info!(
                views = history.len(),
                latest = %latest.id(),
                members = latest.len(),
                "recovered topology history"
            );
        }

        Ok(Self {
            history: Mutex::new(history),
            meta: Some(meta),
        })
    }

    /// Record an accepted view: persist, then apply.
    ///
    /// A persistence failure is returned but the view is still applied in
    /// memory, which stays authoritative until the next successful write.
    pub fn record(&self, view: &View) -> Result<(), ClusterError> {
        let mut history = self.history.lock().expect("topology lock poisoned");

        let persisted = match &self.meta {
            Some(meta) => meta.put_view(view).map_err(ClusterError::from),
            None => Ok(()),
        };
        if let Err(e) = &persisted {
            error!(view_id = %view.id(), error = %e, "failed to persist view");
        }

        let evicted = history.insert(view.clone());
        self.forget(&evicted);
        debug!(view_id = %view.id(), retained = history.len(), "recorded view");
        persisted
    }

    /// Merge another history (typically the coordinator's) into this one.
    pub fn merge(&self, other: &TopologyHistory) -> Result<(), ClusterError> {
        let mut history = self.history.lock().expect("topology lock poisoned");

        if let Some(meta) = &self.meta {
            for view in other.iter().filter(|v| !history.contains(&v.id())) {
                meta.put_view(view)?;
            }
        }

        let before = history.len();
        let evicted = history.merge(other);
        self.forget(&evicted);
        debug!(
            incoming = other.len(),
            before,
            after = history.len(),
            "merged topology history"
        );
        Ok(())
    }

    /// Encode the current history for the coordinator's state transfer.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>, ClusterError> {
        self.history
            .lock()
            .expect("topology lock poisoned")
            .to_bytes()
    }

    /// Decode and merge a history received from the coordinator.
    pub fn merge_snapshot(&self, bytes: &[u8]) -> Result<(), ClusterError> {
        let other = TopologyHistory::from_bytes(bytes, self.retention())?;
        self.merge(&other)
    }

    /// The newest recorded view.
    pub fn latest(&self) -> Option<View> {
        self.lock().latest().cloned()
    }

    /// The newest view whose timestamp is `<= ts`.
    pub fn as_of(&self, ts: HlcTimestamp) -> Option<View> {
        self.lock().as_of(ts).cloned()
    }

    /// The oldest view whose timestamp is `>= ts`.
    pub fn earliest_since(&self, ts: HlcTimestamp) -> Option<View> {
        self.lock().earliest_since(ts).cloned()
    }

    /// All retained views, newest first.
    pub fn history(&self) -> Vec<View> {
        self.lock().iter().cloned().collect()
    }

    /// A copy of the in-memory history.
    pub fn to_history(&self) -> TopologyHistory {
        self.lock().clone()
    }

    /// Number of retained views.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no view has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of retained views.
    pub fn retention(&self) -> usize {
        self.lock().retention()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TopologyHistory> {
        self.history.lock().expect("topology lock poisoned")
    }

    fn forget(&self, evicted: &[ViewId]) {
        let Some(meta) = &self.meta else {
            return;
        };
        for id in evicted {
            if let Err(e) = meta.remove_view(id) {
                warn!(view_id = %id, error = %e, "failed to remove evicted view");
            }
        }
    }
}

impl std::fmt::Debug for TopologyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyStore")
            .field("views", &self.len())
            .field("persistent", &self.meta.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use atoll_types::{NodeId, NodeIdentity, NodeRole};

    use super::*;

    fn view(ts: u64, members: &[u8]) -> View {
        let members: Vec<NodeIdentity> = members
            .iter()
            .map(|n| NodeIdentity::new(NodeId::from([*n; 16]), format!("h{n}"), NodeRole::Worker))
            .collect();
        View::new(ViewId::new(HlcTimestamp::new(ts, 0), NodeId::from([1u8; 16])), members)
    }

    fn stamps(history: &TopologyHistory) -> Vec<u64> {
        history
            .iter()
            .map(|v| v.id().timestamp.physical_millis())
            .collect()
    }

    #[test]
    fn test_history_newest_first_and_capped() {
        let mut history = TopologyHistory::new(3);
        for ts in [10, 30, 20, 40] {
            history.insert(view(ts, &[1]));
        }
        assert_eq!(stamps(&history), vec![40, 30, 20]);
        assert_eq!(history.latest().unwrap().id().timestamp.physical_millis(), 40);
    }

    #[test]
    fn test_insert_older_than_all_into_full_history_evicts_itself() {
        let mut history = TopologyHistory::new(2);
        history.insert(view(20, &[1]));
        history.insert(view(30, &[1]));
        let evicted = history.insert(view(10, &[1]));
        assert_eq!(evicted, vec![view(10, &[1]).id()]);
        assert_eq!(stamps(&history), vec![30, 20]);
    }

    #[test]
    fn test_as_of_and_earliest_since() {
        let mut history = TopologyHistory::new(5);
        for ts in [100, 200, 300] {
            history.insert(view(ts, &[1]));
        }
        let at = |ts| HlcTimestamp::new(ts, 0);

        assert_eq!(stamps_of(history.as_of(at(250))), Some(200));
        assert_eq!(stamps_of(history.as_of(at(300))), Some(300));
        assert_eq!(stamps_of(history.as_of(at(50))), None);

        assert_eq!(stamps_of(history.earliest_since(at(150))), Some(200));
        assert_eq!(stamps_of(history.earliest_since(at(100))), Some(100));
        assert_eq!(stamps_of(history.earliest_since(at(301))), None);
    }

    fn stamps_of(view: Option<&View>) -> Option<u64> {
        view.map(|v| v.id().timestamp.physical_millis())
    }

    #[test]
    fn test_merge_with_self_is_noop() {
        let mut history = TopologyHistory::new(3);
        for ts in [1, 2, 3, 4] {
            history.insert(view(ts, &[1, 2]));
        }
        let copy = history.clone();
        let evicted = history.merge(&copy);
        assert!(evicted.is_empty());
        assert_eq!(history, copy);
    }

    #[test]
    fn test_merge_commutative_for_disjoint() {
        let mut a = TopologyHistory::new(4);
        let mut b = TopologyHistory::new(4);
        for ts in [1, 4, 5] {
            a.insert(view(ts, &[1]));
        }
        for ts in [2, 3, 6] {
            b.insert(view(ts, &[2]));
        }

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);
        assert_eq!(stamps(&ab), vec![6, 5, 4, 3]);
    }

    #[test]
    fn test_bytes_roundtrip_preserves_order() {
        let mut history = TopologyHistory::new(5);
        for ts in [7, 9, 8] {
            history.insert(view(ts, &[1, 2, 3]));
        }
        let decoded = TopologyHistory::from_bytes(&history.to_bytes().unwrap(), 5).unwrap();
        assert_eq!(decoded, history);
        assert!(TopologyHistory::from_bytes(&[0xff], 5).is_err());
    }

    #[test]
    fn test_store_record_persists_and_recovers() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let meta = Arc::new(MetaStore::open(tmp.path()).unwrap());
            let store = TopologyStore::open(meta, 3).unwrap();
            assert!(store.is_empty());
            for ts in 1..=5 {
                store.record(&view(ts, &[1, 2])).unwrap();
            }
            assert_eq!(store.len(), 3);
        }

        let meta = Arc::new(MetaStore::open(tmp.path()).unwrap());
        // Evicted views were removed from disk too.
        assert_eq!(meta.view_count().unwrap(), 3);
        let store = TopologyStore::open(meta, 3).unwrap();
        let recovered: Vec<u64> = store
            .history()
            .iter()
            .map(|v| v.id().timestamp.physical_millis())
            .collect();
        assert_eq!(recovered, vec![5, 4, 3]);
    }

    #[test]
    fn test_open_with_smaller_retention_trims_disk() {
        let meta = Arc::new(MetaStore::open_temporary().unwrap());
        for ts in 1..=6 {
            meta.put_view(&view(ts, &[1])).unwrap();
        }
        let store = TopologyStore::open(meta.clone(), 2).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(meta.view_count().unwrap(), 2);
    }

    #[test]
    fn test_store_snapshot_merge() {
        let coordinator = TopologyStore::in_memory(5);
        for ts in [10, 20, 30] {
            coordinator.record(&view(ts, &[1, 2])).unwrap();
        }

        let meta = Arc::new(MetaStore::open_temporary().unwrap());
        let joiner = TopologyStore::open(meta.clone(), 5).unwrap();
        joiner.record(&view(5, &[3])).unwrap();
        joiner
            .merge_snapshot(&coordinator.snapshot_bytes().unwrap())
            .unwrap();

        assert_eq!(joiner.len(), 4);
        assert_eq!(joiner.latest().unwrap().id(), view(30, &[]).id());
        assert_eq!(meta.view_count().unwrap(), 4);

        // Applying the same snapshot again changes nothing.
        let before = joiner.to_history();
        joiner
            .merge_snapshot(&coordinator.snapshot_bytes().unwrap())
            .unwrap();
        assert_eq!(joiner.to_history(), before);
    }

    #[test]
    fn test_store_point_in_time_queries() {
        let store = TopologyStore::in_memory(5);
        store.record(&view(100, &[1])).unwrap();
        store.record(&view(200, &[1, 2])).unwrap();
        let mid = store.as_of(HlcTimestamp::new(150, 0)).unwrap();
        assert_eq!(mid.len(), 1);
        let next = store.earliest_since(HlcTimestamp::new(150, 0)).unwrap();
        assert_eq!(next.len(), 2);
    }
}
