//! Local persistence for atoll nodes, wrapping Fjall.
//!
//! [`MetaStore`] provides typed accessors over three keyspaces:
//!
//! - `identity`: instance key → serialized [`NodeIdentity`](atoll_types::NodeIdentity),
//!   so a restarted process keeps its id
//! - `cluster`: the persisted [`ClusterShape`](atoll_types::ClusterShape)
//! - `topology`: [`ViewId`](atoll_types::ViewId) key → serialized
//!   [`View`](atoll_types::View), the retained membership history

mod error;
mod store;

pub use error::MetaError;
pub use store::MetaStore;
