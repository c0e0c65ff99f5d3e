//! Membership and partitioning core of atoll.
//!
//! This crate provides:
//!
//! - [`ClusterConfig`]: cluster-wide settings, validated at startup.
//! - [`MembershipPolicy`] / [`DefaultMembershipPolicy`]: member ordering and
//!   coordinator election, installed into the transport.
//! - [`ClusterMetadata`]: the partition → nodes table, recomputed on every
//!   accepted view with lock-free reads.
//! - [`TopologyStore`]: the persisted, bounded history of views.
//! - [`JoinAuthenticator`]: HMAC-signed join tokens binding joiners to the
//!   cluster's name and shape.
//! - [`IdentityGenerator`]: stable per-process node ids.
//! - [`check_shape`]: refuses to start when the persisted shape disagrees
//!   with the configuration.

pub mod auth;
mod config;
mod error;
mod identity;
pub mod metadata;
pub mod policy;
mod shape;
pub mod topology;


pub use auth::{JoinAuthenticator, JoinRejection, JoinToken};
pub use config::{
    ClusterConfig, DEFAULT_BACKUP_COUNT, DEFAULT_PARTITION_COUNT, DEFAULT_RETENTION_COUNT,
};
pub use error::ClusterError;
pub use identity::{IdentityGenerator, default_instance_key, detect_host_name};
pub use metadata::{
    ClusterMetadata, MetadataUpdater, NeighborhoodSource, Partition, PartitionDelta,
    PartitionTable, hash_key,
};
pub use policy::{DefaultMembershipPolicy, MembershipPolicy, compare_members};
pub use shape::check_shape;
pub use topology::{TopologyHistory, TopologyStore};
