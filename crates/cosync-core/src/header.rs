//! Immutable value headers and content-addressed identity.
//!
//! A header fixes everything about a value that never changes: its kind, the
//! ruleset governing access, optional metadata and a uniqueness nonce. The
//! value's id is the hash of the canonical header bytes, so any change to a
//! header field yields a different value.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::canonical::canonical_header_bytes;
use crate::types::{AgentId, ValueId};

/// Domain separation prefix for value ids.
const VALUE_ID_DOMAIN: &[u8] = b"cosync-value-v0:";

/// Discriminator for how a value's transactions are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Map,
    List,
    Stream,
    BinaryStream,
    Group,
    Account,
    PlainText,
}

impl ValueKind {
    /// Convert to the integer used in canonical encoding.
    pub const fn to_u8(self) -> u8 {
        match self {
            ValueKind::Map => 0,
            ValueKind::List => 1,
            ValueKind::Stream => 2,
            ValueKind::BinaryStream => 3,
            ValueKind::Group => 4,
            ValueKind::Account => 5,
            ValueKind::PlainText => 6,
        }
    }

    /// Parse from the canonical integer.
    pub const fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(ValueKind::Map),
            1 => Some(ValueKind::List),
            2 => Some(ValueKind::Stream),
            3 => Some(ValueKind::BinaryStream),
            4 => Some(ValueKind::Group),
            5 => Some(ValueKind::Account),
            6 => Some(ValueKind::PlainText),
            _ => None,
        }
    }

    /// Groups and accounts carry identity and permission data.
    pub const fn is_identity(self) -> bool {
        matches!(self, ValueKind::Group | ValueKind::Account)
    }

    pub const fn name(self) -> &'static str {
        match self {
            ValueKind::Map => "map",
            ValueKind::List => "list",
            ValueKind::Stream => "stream",
            ValueKind::BinaryStream => "binary-stream",
            ValueKind::Group => "group",
            ValueKind::Account => "account",
            ValueKind::PlainText => "plain-text",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Who may read and write a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ruleset {
    /// The value is itself a group; its log is a role table.
    Group { initial_admin: AgentId },
    /// Access follows the role table of another group value.
    OwnedByGroup { group: ValueId },
    /// Only the owner may write.
    OwnedByAgent { owner: AgentId },
    /// Anyone may write. Only reachable with an explicit opt-in.
    UnsafeAllowAll,
}

impl Ruleset {
    pub const fn name(&self) -> &'static str {
        match self {
            Ruleset::Group { .. } => "group",
            Ruleset::OwnedByGroup { .. } => "owned-by-group",
            Ruleset::OwnedByAgent { .. } => "owned-by-agent",
            Ruleset::UnsafeAllowAll => "unsafe-allow-all",
        }
    }

    /// The group this value depends on for permissions, if any.
    pub fn owner_group(&self) -> Option<ValueId> {
        match self {
            Ruleset::OwnedByGroup { group } => Some(*group),
            _ => None,
        }
    }
}

/// Optional header metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeaderMeta {
    /// A value this one is derived from.
    pub source: Option<ValueId>,
    /// Free-form string attributes.
    pub attrs: BTreeMap<String, String>,
}

/// The immutable header of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueHeader {
    pub kind: ValueKind,
    pub ruleset: Ruleset,
    pub meta: Option<HeaderMeta>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Random creation nonce; `None` for deterministic values.
    pub uniqueness: Option<[u8; 16]>,
}

impl ValueHeader {
    /// A new header with a random uniqueness nonce.
    pub fn new(kind: ValueKind, ruleset: Ruleset, created_at: u64) -> Self {
        let mut uniqueness = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut uniqueness);
        Self {
            kind,
            ruleset,
            meta: None,
            created_at,
            uniqueness: Some(uniqueness),
        }
    }

    /// A header whose id depends only on its visible fields.
    pub fn deterministic(kind: ValueKind, ruleset: Ruleset, created_at: u64) -> Self {
        Self {
            kind,
            ruleset,
            meta: None,
            created_at,
            uniqueness: None,
        }
    }

    /// Attach metadata.
    pub fn with_meta(mut self, meta: HeaderMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Compute the content-addressed id of this header.
    pub fn id(&self) -> ValueId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(VALUE_ID_DOMAIN);
        hasher.update(&canonical_header_bytes(self));
        ValueId(*hasher.finalize().as_bytes())
    }

    /// Values this one cannot be validated without.
    pub fn dependencies(&self) -> Vec<ValueId> {
        let mut deps: Vec<ValueId> = self.ruleset.owner_group().into_iter().collect();
        if let Some(source) = self.meta.as_ref().and_then(|m| m.source) {
            deps.push(source);
        }
        deps
    }
}
