//! Error types for the placement crate.

/// Errors returned by [`PartitionMapper::allocate`](crate::PartitionMapper::allocate).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// Placement was requested with an empty candidate set.
    #[error("no candidate nodes to place partition {partition}")]
    NoCandidates {
        /// The partition being placed.
        partition: u32,
    },
}
