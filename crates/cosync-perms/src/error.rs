//! Error types for the permissions module.

use thiserror::Error;

use cosync_core::{AgentId, KeyId, ValueId};

/// Errors that can occur while building permission changes.
///
/// Validation of incoming transactions never errors; disallowed transactions
/// are simply excluded from content.
#[derive(Debug, Error)]
pub enum PermsError {
    /// The acting agent lacks the role needed for this change.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The group value is not available locally.
    #[error("group not available: {0}")]
    GroupUnavailable(ValueId),

    /// The value is not a group.
    #[error("value {0} is not a group")]
    NotAGroup(ValueId),

    /// A key needed for this operation cannot be obtained.
    #[error("key {0} is not readable")]
    KeyUnavailable(KeyId),

    /// The member is not part of the group.
    #[error("agent {0:?} is not a member")]
    NotAMember(AgentId),

    /// Extending would create a cycle of parent groups.
    #[error("extending {child} with {parent} would create a cycle")]
    ParentCycle { child: ValueId, parent: ValueId },

    /// Invalid role for this operation.
    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// Core error.
    #[error("core error: {0}")]
    CoreError(#[from] cosync_core::CoreError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
