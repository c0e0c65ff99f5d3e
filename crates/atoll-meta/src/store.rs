//! [`MetaStore`] implementation wrapping Fjall keyspaces.

use std::path::Path;

use atoll_types::{ClusterShape, NodeIdentity, View, ViewId};
use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use tempfile::TempDir;
use tracing::debug;

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// Key under which the cluster shape is stored in the `cluster` keyspace.
const SHAPE_KEY: &[u8] = b"shape";

/// Local metadata store backed by Fjall.
pub struct MetaStore {
    /// The underlying Fjall database handle.
    #[allow(dead_code)]
    db: Database,
    /// Instance key → serialized NodeIdentity.
    identity: Keyspace,
    /// `"shape"` → serialized ClusterShape.
    cluster: Keyspace,
    /// timestamp (8 bytes BE) ++ creator (16 bytes) → serialized View.
    topology: Keyspace,
    /// Backing directory of a temporary store, removed on drop.
    _tmp: Option<TempDir>,
}

impl MetaStore {
    /// Open a persistent MetaStore at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db, None)
    }

    /// Open a temporary MetaStore that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db, Some(tmp))
    }

    fn init_keyspaces(db: Database, tmp: Option<TempDir>) -> Result<Self> {
        let identity = db.keyspace("identity", KeyspaceCreateOptions::default)?;
        let cluster = db.keyspace("cluster", KeyspaceCreateOptions::default)?;
        let topology = db.keyspace("topology", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            identity,
            cluster,
            topology,
            _tmp: tmp,
        })
    }

    // ----- Identity -----

    /// Store the identity generated for a process instance.
    pub fn put_identity(&self, instance_key: &str, identity: &NodeIdentity) -> Result<()> {
        let value = postcard::to_allocvec(identity)?;
        self.identity.insert(instance_key.as_bytes(), value.as_slice())?;
        debug!(instance_key, node_id = %identity.id, "stored identity");
        Ok(())
    }

    /// Retrieve the identity stored for a process instance.
    pub fn get_identity(&self, instance_key: &str) -> Result<Option<NodeIdentity>> {
        match self.identity.get(instance_key.as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    // ----- Cluster shape -----

    /// Persist the cluster shape, replacing any previous one.
    pub fn put_shape(&self, shape: &ClusterShape) -> Result<()> {
        let value = postcard::to_allocvec(shape)?;
        self.cluster.insert(SHAPE_KEY, value.as_slice())?;
        debug!(
            cluster = %shape.cluster_name,
            partitions = shape.partition_count,
            backups = shape.backup_count,
            "stored cluster shape"
        );
        Ok(())
    }

    /// Retrieve the persisted cluster shape.
    pub fn get_shape(&self) -> Result<Option<ClusterShape>> {
        match self.cluster.get(SHAPE_KEY)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    // ----- Topology history -----

    /// Store a view, keyed by its id.
    pub fn put_view(&self, view: &View) -> Result<()> {
        let value = postcard::to_allocvec(view)?;
        self.topology.insert(view.id().to_key().as_slice(), value.as_slice())?;
        debug!(view_id = %view.id(), members = view.len(), "stored view");
        Ok(())
    }

    /// Retrieve a view by id.
    pub fn get_view(&self, id: &ViewId) -> Result<Option<View>> {
        match self.topology.get(id.to_key().as_slice())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List every stored view, oldest first.
    pub fn list_views(&self) -> Result<Vec<View>> {
        let mut views = Vec::new();
        for guard in self.topology.iter() {
            let (key, value) = guard.into_inner()?;
            if ViewId::from_key(&key).is_none() {
                return Err(MetaError::CorruptKey {
                    keyspace: "topology",
                    len: key.len(),
                });
            }
            views.push(postcard::from_bytes(&value)?);
        }
        Ok(views)
    }

    /// Remove a view.
    pub fn remove_view(&self, id: &ViewId) -> Result<()> {
        self.topology.remove(id.to_key().as_slice())?;
        debug!(view_id = %id, "removed view");
        Ok(())
    }

    /// Return the number of stored views.
    ///
    /// Note: this is an O(n) scan.
    pub fn view_count(&self) -> Result<usize> {
        let mut count = 0;
        for guard in self.topology.iter() {
            let _ = guard.key()?;
            count += 1;
        }
        Ok(count)
    }
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore")
            .field("temporary", &self._tmp.is_some())
            .finish_non_exhaustive()
    }
}
