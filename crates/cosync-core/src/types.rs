//! Strong type definitions for cosync.
//!
//! All identifiers are newtypes. On the wire and in storage they travel in
//! their string form (`co_…`, `agent_…`, `…_session_…`, `key_…`), which is also
//! the form used as map keys inside group logs.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::crypto::{SealerId, SignerId};
use crate::error::CoreError;

macro_rules! serde_as_string {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fn parse_hex_array<const N: usize>(s: &str) -> Result<[u8; N], CoreError> {
    let bytes = hex::decode(s).map_err(|e| CoreError::MalformedId(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::MalformedId(format!("expected {N} bytes in {s}")))
}

/// A 32-byte value identifier: the Blake3 hash of the canonical header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub [u8; 32]);

impl ValueId {
    /// Create a new ValueId from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "co_{}", self.to_hex())
    }
}

impl FromStr for ValueId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix("co_")
            .ok_or_else(|| CoreError::MalformedId(format!("value id without co_ prefix: {s}")))?;
        Ok(Self(parse_hex_array(hex)?))
    }
}

serde_as_string!(ValueId);

/// The public identity of an agent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId {
    pub signer: SignerId,
    pub sealer: SealerId,
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", &hex::encode(self.signer.0)[..16])
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agent_{}{}",
            hex::encode(self.signer.0),
            hex::encode(self.sealer.0)
        )
    }
}

impl FromStr for AgentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix("agent_")
            .ok_or_else(|| CoreError::MalformedId(format!("agent id without agent_ prefix: {s}")))?;
        if hex.len() != 128 {
            return Err(CoreError::MalformedId(format!("agent id has wrong length: {s}")));
        }
        Ok(Self {
            signer: SignerId(parse_hex_array(&hex[..64])?),
            sealer: SealerId(parse_hex_array(&hex[64..])?),
        })
    }
}

serde_as_string!(AgentId);

/// One agent's writing session on one value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub agent: AgentId,
    pub nonce: u64,
}

impl SessionId {
    /// A fresh session for the given agent.
    pub fn new_random(agent: AgentId) -> Self {
        Self {
            agent,
            nonce: rand::random(),
        }
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionId({}, {:016x})",
            &hex::encode(self.agent.signer.0)[..16],
            self.nonce
        )
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_session_{:016x}", self.agent, self.nonce)
    }
}

impl FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (agent, nonce) = s
            .split_once("_session_")
            .ok_or_else(|| CoreError::MalformedId(format!("not a session id: {s}")))?;
        let nonce =
            u64::from_str_radix(nonce, 16).map_err(|e| CoreError::MalformedId(e.to_string()))?;
        Ok(Self {
            agent: agent.parse()?,
            nonce,
        })
    }
}

serde_as_string!(SessionId);

/// Identifier of a symmetric group key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub [u8; 16]);

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key_{}", hex::encode(self.0))
    }
}

impl FromStr for KeyId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix("key_")
            .ok_or_else(|| CoreError::MalformedId(format!("key id without key_ prefix: {s}")))?;
        Ok(Self(parse_hex_array(hex)?))
    }
}

serde_as_string!(KeyId);

/// Position of one transaction: session plus index within the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    pub session: SessionId,
    pub index: u32,
}

/// Stable identity of one change: transaction plus position within it.
///
/// List items are keyed by the `OpId` of the change that inserted them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub tx: TransactionId,
    pub change: u32,
}
