//! Error types for cosync core.

use thiserror::Error;

use crate::types::{SessionId, ValueId};

/// Core errors that can occur while building or ingesting transactions.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature for session {0}")]
    InvalidSignature(SessionId),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("transaction too large: {size} bytes exceeds limit of {limit}")]
    TransactionTooLarge { size: usize, limit: usize },

    #[error("missing prefix for session {session}: have {known}, content starts after {after}")]
    MissingPrefix {
        session: SessionId,
        known: u32,
        after: u32,
    },

    #[error("header does not match value id {0}")]
    HeaderMismatch(ValueId),

    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("malformed identifier: {0}")]
    MalformedId(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Structural validation errors for headers and content messages.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("ruleset {ruleset} is not allowed for value kind {kind}")]
    RulesetKindMismatch { ruleset: &'static str, kind: &'static str },

    #[error("too many header attributes: {count} exceeds {limit}")]
    TooManyAttributes { count: usize, limit: usize },

    #[error("content for {0} carries a header with a different id")]
    HeaderIdMismatch(ValueId),

    #[error("empty transaction list for session {0}")]
    EmptySessionContent(SessionId),

    #[error("structural error: {0}")]
    StructuralError(String),
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::HeaderMismatch(id) => ValidationError::HeaderIdMismatch(id),
            other => ValidationError::StructuralError(other.to_string()),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
