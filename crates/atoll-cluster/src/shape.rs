//! Startup guard against changing the cluster shape.

use atoll_meta::MetaStore;
use atoll_types::ClusterShape;
use tracing::{info, warn};

use crate::{ClusterConfig, ClusterError};

/// Compare the configured shape with the persisted one.
///
/// On first start the configured shape is persisted. A different cluster
/// name or partition count is fatal; a different backup count is accepted
/// and persisted.
pub fn check_shape(meta: &MetaStore, config: &ClusterConfig) -> Result<ClusterShape, ClusterError> {
    let configured = config.shape();
    match meta.get_shape()? {
        None => {
            info!(
                cluster = %configured.cluster_name,
                partitions = configured.partition_count,
                backups = configured.backup_count,
                "persisting initial cluster shape"
            );
            meta.put_shape(&configured)?;
        }
        Some(persisted)
            if persisted.cluster_name != configured.cluster_name
                || persisted.partition_count != configured.partition_count =>
        {
            return Err(ClusterError::ShapeChanged {
                persisted_name: persisted.cluster_name,
                persisted_partitions: persisted.partition_count,
                configured_name: configured.cluster_name,
                configured_partitions: configured.partition_count,
            });
        }
        Some(persisted) if persisted.backup_count != configured.backup_count => {
            warn!(
                from = persisted.backup_count,
                to = configured.backup_count,
                "backup count changed since last start"
            );
            meta.put_shape(&configured)?;
        }
        Some(_) => {}
    }
    Ok(configured)
}
