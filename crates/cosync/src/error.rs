//! Error types for the node.

use cosync_core::{CoreError, ValidationError, ValueId, ValueKind};
use cosync_perms::PermsError;
use cosync_store::StoreError;
use cosync_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node cannot start or the request conflicts with its configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Permission error.
    #[error("permission error: {0}")]
    Permission(#[from] PermsError),

    /// The value is not held by this node. Load it first.
    #[error("value not loaded: {0}")]
    NotLoaded(ValueId),

    /// The operation does not apply to this kind of value.
    #[error("value {id} is a {actual}, expected {expected}")]
    WrongKind {
        id: ValueId,
        expected: &'static str,
        actual: &'static str,
    },

    /// The local agent may not make this change.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Position outside the current content.
    #[error("index {index} out of range (length {len})")]
    OutOfRange { index: usize, len: usize },

    /// Timed out waiting for peers.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl NodeError {
    pub(crate) fn wrong_kind(id: ValueId, expected: ValueKind, actual: ValueKind) -> Self {
        NodeError::WrongKind {
            id,
            expected: expected.name(),
            actual: actual.name(),
        }
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
