//! Error types for the sync module.

use thiserror::Error;

use crate::messages::PeerId;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Message failed to decode or broke a size limit.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Storage operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] cosync_store::StoreError),

    /// Content failed structural validation.
    #[error("validation error: {0}")]
    ValidationError(#[from] cosync_core::ValidationError),

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Peer is not connected.
    #[error("peer not connected: {0}")]
    PeerNotConnected(PeerId),

    /// A peer with this id is already connected.
    #[error("peer already connected: {0}")]
    DuplicatePeer(PeerId),

    /// The wait was cancelled, usually because the peer went away.
    #[error("sync cancelled")]
    Cancelled,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
