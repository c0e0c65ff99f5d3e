//! Join tokens binding a joining node to the cluster's identity and shape.
//!
//! A [`JoinToken`] carries the joiner's view of `{cluster_name,
//! partition_count, backup_count}` signed with HMAC-SHA256 under the shared
//! cluster key. The coordinator's [`JoinAuthenticator`] refuses the join if
//! the signature is wrong or any field differs from its own configuration,
//! so two independently configured clusters never merge.
//!
//! Tokens are regenerated per handshake. Replay protection is left to the
//! transport.

use std::time::{SystemTime, UNIX_EPOCH};

use atoll_types::ClusterShape;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::{ClusterConfig, ClusterError};

type HmacSha256 = Hmac<Sha256>;

/// Why a join token was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinRejection {
    /// The signature does not match the claims under the local key.
    #[error("bad signature")]
    BadSignature,

    /// Different cluster name.
    #[error("cluster name mismatch: expected {expected}, got {got}")]
    ClusterNameMismatch {
        /// Local cluster name.
        expected: String,
        /// Name carried by the token.
        got: String,
    },

    /// Different partition count.
    #[error("partition count mismatch: expected {expected}, got {got}")]
    PartitionCountMismatch {
        /// Local partition count.
        expected: u32,
        /// Count carried by the token.
        got: u32,
    },

    /// Different backup count.
    #[error("backup count mismatch: expected {expected}, got {got}")]
    BackupCountMismatch {
        /// Local backup count.
        expected: u32,
        /// Count carried by the token.
        got: u32,
    },

    /// The token bytes could not be decoded.
    #[error("malformed token: {0}")]
    Malformed(String),
}

/// The signed portion of a token.
#[derive(Serialize)]
struct Claims<'a> {
    cluster_name: &'a str,
    partition_count: u32,
    backup_count: u32,
    issued_at: u64,
}

/// A signed join token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinToken {
    /// Cluster the joiner wants to join.
    pub cluster_name: String,
    /// Joiner's configured partition count.
    pub partition_count: u32,
    /// Joiner's configured backup count.
    pub backup_count: u32,
    /// Issue time, unix milliseconds.
    pub issued_at: u64,
    /// HMAC-SHA256 over the postcard-encoded claims.
    pub signature: Vec<u8>,
}

impl JoinToken {
    /// Encode for the transport handshake.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClusterError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode a token received in a handshake.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, JoinRejection> {
        postcard::from_bytes(bytes).map_err(|e| JoinRejection::Malformed(e.to_string()))
    }

    fn claims(&self) -> Claims<'_> {
        Claims {
            cluster_name: &self.cluster_name,
            partition_count: self.partition_count,
            backup_count: self.backup_count,
            issued_at: self.issued_at,
        }
    }
}

/// Issues and verifies join tokens for one cluster shape.
#[derive(Clone)]
pub struct JoinAuthenticator {
    shape: ClusterShape,
    key: Vec<u8>,
}

impl JoinAuthenticator {
    /// Create an authenticator for `shape` signing with `key`.
    pub fn new(shape: ClusterShape, key: impl Into<Vec<u8>>) -> Self {
        Self {
            shape,
            key: key.into(),
        }
    }

    /// Create an authenticator from the cluster configuration.
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.shape(), config.shared_auth_key.clone())
    }

    /// The shape this authenticator issues tokens for and verifies against.
    pub fn shape(&self) -> &ClusterShape {
        &self.shape
    }

    /// Issue a fresh token for the local shape.
    pub fn issue(&self) -> JoinToken {
        let issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut token = JoinToken {
            cluster_name: self.shape.cluster_name.clone(),
            partition_count: self.shape.partition_count,
            backup_count: self.shape.backup_count,
            issued_at,
            signature: Vec::new(),
        };
        token.signature = self.sign(&token);
        debug!(cluster = %token.cluster_name, issued_at, "issued join token");
        token
    }

    /// Verify a token against the local shape.
    pub fn verify(&self, token: &JoinToken) -> Result<(), JoinRejection> {
        let expected = self.sign(token);
        if !bool::from(expected.ct_eq(&token.signature)) {
            warn!(cluster = %token.cluster_name, "join token signature mismatch");
            return Err(JoinRejection::BadSignature);
        }

        if token.cluster_name != self.shape.cluster_name {
            return Err(JoinRejection::ClusterNameMismatch {
                expected: self.shape.cluster_name.clone(),
                got: token.cluster_name.clone(),
            });
        }
        if token.partition_count != self.shape.partition_count {
            return Err(JoinRejection::PartitionCountMismatch {
                expected: self.shape.partition_count,
                got: token.partition_count,
            });
        }
        if token.backup_count != self.shape.backup_count {
            return Err(JoinRejection::BackupCountMismatch {
                expected: self.shape.backup_count,
                got: token.backup_count,
            });
        }
        Ok(())
    }

    /// Decode and verify a token in one step.
    pub fn verify_bytes(&self, bytes: &[u8]) -> Result<(), JoinRejection> {
        self.verify(&JoinToken::from_bytes(bytes)?)
    }

    fn sign(&self, token: &JoinToken) -> Vec<u8> {
        // Encoding a borrowed struct of strings and integers into a Vec cannot fail.
        let payload = postcard::to_allocvec(&token.claims()).unwrap_or_default();
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(&payload);
        mac.finalize().into_bytes().to_vec()
    }
}

impl std::fmt::Debug for JoinAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinAuthenticator")
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}
