//! MeshForestError: Unified error type for mesh-forest public APIs
//!
//! Every fallible operation in the crate returns this type. Errors that must be
//! agreed on by the whole process group (`Range`, `CollectiveMismatch`) are
//! computed from data every rank holds identically, so all ranks reach the same
//! verdict without an extra round of messages.

use crate::cmesh::tree::TreeId;
use crate::scheme::ElementClass;
use thiserror::Error;

/// Unified error type for mesh-forest operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshForestError {
    /// `commit` was called with zero or several construction sources, or with
    /// an incomplete/invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A face join is inconsistent with the trees it references.
    #[error("connectivity error at tree {tree}, face {face}: {reason}")]
    Connectivity {
        tree: TreeId,
        face: u8,
        reason: String,
    },
    /// Partition ranges/offsets are not monotone or do not cover every tree exactly once.
    #[error("range error: {0}")]
    Range(String),
    /// Ranks disagree on the call sequence or on a group-wide value. Fatal.
    #[error("collective mismatch: {0}")]
    CollectiveMismatch(String),
    /// Point-to-point transport failure or malformed frame.
    #[error("communication error with rank {neighbor}: {message}")]
    CommError { neighbor: usize, message: String },
    /// A tree id outside the coarse mesh, or not held on this rank.
    #[error("unknown tree {0}")]
    UnknownTree(TreeId),
    /// No element scheme registered for the class.
    #[error("no element scheme registered for class {0:?}")]
    UnknownClass(ElementClass),
    /// A structural invariant of a committed object does not hold.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl MeshForestError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        MeshForestError::Configuration(msg.into())
    }

    pub(crate) fn connectivity(tree: TreeId, face: u8, reason: impl Into<String>) -> Self {
        MeshForestError::Connectivity {
            tree,
            face,
            reason: reason.into(),
        }
    }

    /// Whether every rank of the group must abort together on this error.
    pub fn is_collective(&self) -> bool {
        matches!(
            self,
            MeshForestError::Range(_)
                | MeshForestError::CollectiveMismatch(_)
                | MeshForestError::CommError { .. }
        )
    }
}
