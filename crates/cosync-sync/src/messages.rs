//! Sync protocol message types.
//!
//! Four messages are exchanged per value: `Load` asks for a value while
//! stating what the sender holds, `Known` advertises holdings (and, with
//! `is_correction`, overrides a wrong belief), `Content` carries new
//! transactions, and `Done` drops interest.

use std::fmt;

use serde::{Deserialize, Serialize};

use cosync_core::{ContentMessage, KnownState, ValueId};

use crate::error::{Result, SyncError};

/// Identifier of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Generate a random peer id.
    pub fn random() -> Self {
        use rand::Rng;
        let bytes: [u8; 8] = rand::thread_rng().gen();
        let name: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("peer_{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message size limits.
pub mod limits {
    /// Max session pieces in one content message.
    pub const MAX_SESSIONS_PER_CONTENT: usize = 256;
    /// Max transactions in one content message.
    pub const MAX_TRANSACTIONS_PER_CONTENT: usize = 100_000;
    /// Max sessions advertised by a load or known message.
    pub const MAX_KNOWN_SESSIONS: usize = 10_000;
    /// Max encoded size of any message.
    pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
}

/// Limits applied to incoming messages. Defaults come from [`limits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    pub max_sessions_per_content: usize,
    pub max_transactions_per_content: usize,
    pub max_known_sessions: usize,
    pub max_message_bytes: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_sessions_per_content: limits::MAX_SESSIONS_PER_CONTENT,
            max_transactions_per_content: limits::MAX_TRANSACTIONS_PER_CONTENT,
            max_known_sessions: limits::MAX_KNOWN_SESSIONS,
            max_message_bytes: limits::MAX_MESSAGE_BYTES,
        }
    }
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Request a value, stating what the sender already holds.
    Load(KnownState),

    /// Advertise holdings.
    Known {
        known: KnownState,
        /// The receiver's belief about the sender is wrong; replace it.
        is_correction: bool,
    },

    /// New transactions, optionally with the header.
    Content(ContentMessage),

    /// The sender is no longer interested in the value.
    Done { id: ValueId },
}

impl SyncMessage {
    /// Shorthand for a non-correcting `Known`.
    pub fn known(known: KnownState) -> Self {
        SyncMessage::Known {
            known,
            is_correction: false,
        }
    }

    pub fn correction(known: KnownState) -> Self {
        SyncMessage::Known {
            known,
            is_correction: true,
        }
    }

    /// The value this message is about.
    pub fn value_id(&self) -> ValueId {
        match self {
            SyncMessage::Load(known) | SyncMessage::Known { known, .. } => known.id,
            SyncMessage::Content(content) => content.id,
            SyncMessage::Done { id } => *id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Load(_) => "load",
            SyncMessage::Known { .. } => "known",
            SyncMessage::Content(_) => "content",
            SyncMessage::Done { .. } => "done",
        }
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self, limits: &MessageLimits) -> std::result::Result<(), &'static str> {
        match self {
            SyncMessage::Load(known) | SyncMessage::Known { known, .. } => {
                if known.sessions.len() > limits.max_known_sessions {
                    return Err("too many sessions in known state");
                }
            }
            SyncMessage::Content(content) => {
                if content.new.len() > limits.max_sessions_per_content {
                    return Err("too many sessions in content");
                }
                if content.transaction_count() > limits.max_transactions_per_content {
                    return Err("too many transactions in content");
                }
            }
            SyncMessage::Done { .. } => {}
        }
        Ok(())
    }

    /// Encode as CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)
            .map_err(|e| SyncError::InvalidMessage(format!("encode failed: {e}")))?;
        Ok(out)
    }

    /// Decode from CBOR and enforce `limits`.
    pub fn from_bytes(bytes: &[u8], limits: &MessageLimits) -> Result<Self> {
        if bytes.len() > limits.max_message_bytes {
            return Err(SyncError::InvalidMessage(format!(
                "message of {} bytes exceeds limit of {}",
                bytes.len(),
                limits.max_message_bytes
            )));
        }
        let message: SyncMessage = ciborium::from_reader(bytes)
            .map_err(|e| SyncError::InvalidMessage(format!("decode failed: {e}")))?;
        message
            .validate_limits(limits)
            .map_err(|e| SyncError::InvalidMessage(e.into()))?;
        Ok(message)
    }
}

/// Split a content message so none carries more than `max_pieces` sessions.
///
/// The header, if any, stays on the first message.
pub fn split_content(message: ContentMessage, max_pieces: usize) -> Vec<ContentMessage> {
    let max_pieces = max_pieces.max(1);
    if message.new.len() <= max_pieces {
        return vec![message];
    }

    let ContentMessage { id, header, new } = message;
    let mut out: Vec<ContentMessage> = Vec::new();
    for (session, piece) in new {
        match out.last_mut() {
            Some(last) if last.new.len() < max_pieces => {
                last.new.insert(session, piece);
            }
            _ => {
                let mut next = ContentMessage::new(id);
                next.new.insert(session, piece);
                out.push(next);
            }
        }
    }
    if let Some(first) = out.first_mut() {
        first.header = header;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosync_core::{
        AgentSecret, Change, CryptoProvider, DefaultCrypto, Ruleset, SessionId, SessionNewContent,
        Signature, Transaction, ValueHeader, ValueKind,
    };
    use serde_json::json;

    fn content(sessions: u64) -> ContentMessage {
        let header = ValueHeader::new(ValueKind::Map, Ruleset::UnsafeAllowAll, 0);
        let mut msg = ContentMessage::new(header.id());
        msg.header = Some(header);
        let agent = DefaultCrypto.agent_id(&AgentSecret::from_seed(&[3; 32]));
        for nonce in 0..sessions {
            let tx = Transaction::trusting(
                nonce,
                &[Change::MapSet {
                    key: "k".into(),
                    value: json!(nonce),
                }],
            )
            .unwrap();
            msg.new.insert(
                SessionId { agent, nonce },
                SessionNewContent {
                    after: 0,
                    new_transactions: vec![tx],
                    last_signature: Signature([0; 64]),
                },
            );
        }
        msg
    }

    #[test]
    fn test_cbor_round_trip() {
        let msg = SyncMessage::Content(content(3));
        let bytes = msg.to_bytes().unwrap();
        let decoded = SyncMessage::from_bytes(&bytes, &MessageLimits::default()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_limits_enforced_on_decode() {
        let msg = SyncMessage::Content(content(5));
        let bytes = msg.to_bytes().unwrap();
        let tight = MessageLimits {
            max_sessions_per_content: 4,
            ..MessageLimits::default()
        };
        assert!(matches!(
            SyncMessage::from_bytes(&bytes, &tight),
            Err(SyncError::InvalidMessage(_))
        ));

        let tiny = MessageLimits {
            max_message_bytes: 8,
            ..MessageLimits::default()
        };
        assert!(SyncMessage::from_bytes(&bytes, &tiny).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(SyncMessage::from_bytes(&[0xff, 0x00, 0x13], &MessageLimits::default()).is_err());
    }

    #[test]
    fn test_split_keeps_header_on_first() {
        let msg = content(5);
        let id = msg.id;
        let parts = split_content(msg, 2);
        assert_eq!(parts.len(), 3);
        assert!(parts[0].header.is_some());
        assert!(parts[1..].iter().all(|p| p.header.is_none()));
        assert_eq!(parts.iter().map(|p| p.new.len()).sum::<usize>(), 5);
        assert!(parts.iter().all(|p| p.id == id));
    }

    #[test]
    fn test_value_id() {
        let known = KnownState::empty(cosync_core::ValueId::from_bytes([9; 32]));
        assert_eq!(SyncMessage::Load(known.clone()).value_id(), known.id);
        assert_eq!(SyncMessage::correction(known.clone()).action(), "known");
    }
}
