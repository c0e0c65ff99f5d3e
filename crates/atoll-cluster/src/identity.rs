//! Stable per-process node identity.
//!
//! The id is generated once per instance key and persisted in the
//! `identity` keyspace, so a restarted process rejoins under the same id.
//! Descriptive fields (host, start time, role, attributes) are refreshed in
//! place on every start.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use atoll_meta::MetaStore;
use atoll_types::{NodeId, NodeIdentity, NodeRole};
use tracing::info;

use crate::ClusterError;

/// Generates and persists node identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityGenerator;

impl IdentityGenerator {
    /// Load the identity stored under `instance_key`, refreshing its
    /// descriptive fields from `template`, or create a new one.
    ///
    /// The template's `id` is ignored; `started_at` is set to now.
    pub fn load_or_create(
        meta: &MetaStore,
        instance_key: &str,
        template: NodeIdentity,
    ) -> Result<NodeIdentity, ClusterError> {
        let started_at = now_millis();
        let identity = match meta.get_identity(instance_key)? {
            Some(existing) => {
                info!(node_id = %existing.id, instance_key, "reusing persisted node identity");
                NodeIdentity {
                    id: existing.id,
                    started_at,
                    ..template
                }
            }
            None => {
                let id = NodeId::random();
                info!(node_id = %id, instance_key, "generated new node identity");
                NodeIdentity {
                    id,
                    started_at,
                    ..template
                }
            }
        };
        meta.put_identity(instance_key, &identity)?;
        Ok(identity)
    }

    /// Build an identity template for this host.
    pub fn template(role: NodeRole, power_weight: f64) -> NodeIdentity {
        NodeIdentity::new(NodeId::NIL, detect_host_name(), role).with_power_weight(power_weight)
    }
}

/// Instance key identifying one process installation: `host:data_dir`.
pub fn default_instance_key(host: &str, data_dir: &Path) -> String {
    format!("{host}:{}", data_dir.display())
}

/// Best-effort host name: `$HOSTNAME`, then `/etc/hostname`, then `localhost`.
pub fn detect_host_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME")
        && !name.trim().is_empty()
    {
        return name.trim().to_string();
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname")
        && !name.trim().is_empty()
    {
        return name.trim().to_string();
    }
    "localhost".to_string()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
