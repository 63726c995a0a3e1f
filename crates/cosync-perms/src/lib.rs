//! # cosync permissions
//!
//! Groups, roles and key resolution.
//!
//! ## Overview
//!
//! Access control is itself replicated data. A group is a value whose log is a
//! role table plus key revelations; any value owned by that group is readable
//! and writable according to the roles the group held at the time each
//! transaction was made.
//!
//! ## Key Concepts
//!
//! - **Role**: `admin`, `writer`, `reader`, `writeOnly`, `revoked`, and the
//!   invite roles used while someone joins
//! - **Replay**: a group's state is computed by walking its transactions in
//!   global order, dropping the ones their author was not allowed to make
//! - **Inheritance**: `parent_<group>` makes a group inherit another group's
//!   members; cycles are ignored
//! - **Keys**: a read key is revealed either sealed to one agent or encrypted
//!   under another key, so old keys stay reachable after a rotation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use cosync_core::{DefaultCrypto, ValueCore, ValueId};
//! use cosync_perms::PermissionEngine;
//!
//! let values: HashMap<ValueId, ValueCore> = HashMap::new();
//! let mut engine = PermissionEngine::new(Arc::new(DefaultCrypto));
//! // let content = engine.materialize(&values, &core, Some(&my_secret));
//! ```

pub mod engine;
pub mod error;
pub mod group;
pub mod ops;
pub mod role;

pub use engine::{PermissionEngine, ValueResolver};
pub use error::{PermsError, Result};
pub use group::{reveal_nonce, GroupField, GroupState, RoleSubject, SealedReveal};
pub use ops::{
    accept_invite_changes, add_member_changes, create_invite_changes, extend_changes,
    new_group_changes, remove_member_changes, set_everyone_changes,
};
pub use role::{Access, Role};
