//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Header or transaction payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A row referenced by id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The connection lock was poisoned by a panicking writer.
    #[error("storage lock poisoned")]
    Poisoned,

    /// A blocking storage task failed to complete.
    #[error("storage task failed: {0}")]
    TaskFailed(String),

    /// The store has been shut down.
    #[error("storage closed")]
    Closed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
