//! Transactions and the changes they carry.
//!
//! A transaction is one atomic batch of changes inside a session. Trusting
//! transactions carry their changes in plaintext; private transactions carry
//! them encrypted under a group key referenced by [`KeyId`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::crypto::{CryptoProvider, KeySecret};
use crate::error::{CoreError, Result};
use crate::types::{KeyId, OpId, TransactionId, ValueId};

/// Hard limit on the encoded change bytes of one transaction.
pub const MAX_TRANSACTION_SIZE: usize = 1024 * 1024;

/// Where a list insert is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListAnchor {
    Start,
    After(OpId),
}

/// A single change inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    MapSet { key: String, value: JsonValue },
    MapDelete { key: String },
    ListInsert { after: ListAnchor, value: JsonValue },
    ListDelete { target: OpId },
    StreamPush { value: JsonValue },
    BinaryStart { mime_type: String, total_size: Option<u64> },
    BinaryChunk { data: Bytes },
    BinaryEnd,
}

/// Encode a change list to bytes.
pub fn encode_changes(changes: &[Change]) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::into_writer(changes, &mut buf).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a change list from bytes.
pub fn decode_changes(bytes: &[u8]) -> Result<Vec<Change>> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
}

/// Nonce material for the transaction at `tx` within `value`.
///
/// Every transaction position is unique, so each encryption under a group key
/// uses a distinct nonce.
pub fn nonce_material(value: &ValueId, tx: &TransactionId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + 180);
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(tx.session.to_string().as_bytes());
    buf.extend_from_slice(&tx.index.to_be_bytes());
    buf
}

/// One transaction in a session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transaction {
    Trusting {
        made_at: u64,
        changes: Bytes,
        meta: Option<Bytes>,
    },
    Private {
        made_at: u64,
        key_id: KeyId,
        encrypted_changes: Bytes,
        encrypted_meta: Option<Bytes>,
    },
}

impl Transaction {
    /// Build a plaintext transaction.
    pub fn trusting(made_at: u64, changes: &[Change]) -> Result<Self> {
        let changes = encode_changes(changes)?;
        check_size(changes.len())?;
        Ok(Transaction::Trusting {
            made_at,
            changes,
            meta: None,
        })
    }

    /// Build a transaction encrypted under `key`.
    pub fn private(
        crypto: &dyn CryptoProvider,
        key: &KeySecret,
        nonce_material: &[u8],
        made_at: u64,
        changes: &[Change],
    ) -> Result<Self> {
        let plaintext = encode_changes(changes)?;
        check_size(plaintext.len())?;
        let encrypted = crypto.encrypt(key, nonce_material, &plaintext)?;
        Ok(Transaction::Private {
            made_at,
            key_id: key.id(),
            encrypted_changes: Bytes::from(encrypted),
            encrypted_meta: None,
        })
    }

    /// Attach plaintext metadata to a trusting transaction.
    pub fn with_meta(self, meta: Bytes) -> Self {
        match self {
            Transaction::Trusting {
                made_at, changes, ..
            } => Transaction::Trusting {
                made_at,
                changes,
                meta: Some(meta),
            },
            private => private,
        }
    }

    pub fn made_at(&self) -> u64 {
        match self {
            Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => {
                *made_at
            }
        }
    }

    pub fn key_id(&self) -> Option<KeyId> {
        match self {
            Transaction::Trusting { .. } => None,
            Transaction::Private { key_id, .. } => Some(*key_id),
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Transaction::Private { .. })
    }

    /// Size of the payload for checkpoint accounting.
    pub fn byte_size(&self) -> usize {
        match self {
            Transaction::Trusting { changes, meta, .. } => {
                changes.len() + meta.as_ref().map_or(0, |m| m.len())
            }
            Transaction::Private {
                encrypted_changes,
                encrypted_meta,
                ..
            } => encrypted_changes.len() + encrypted_meta.as_ref().map_or(0, |m| m.len()),
        }
    }

    /// Decode the changes of a trusting transaction.
    pub fn decode_trusting(&self) -> Option<Result<Vec<Change>>> {
        match self {
            Transaction::Trusting { changes, .. } => Some(decode_changes(changes)),
            Transaction::Private { .. } => None,
        }
    }

    /// Decrypt and decode the changes of a private transaction.
    ///
    /// Returns `None` if the ciphertext does not open under `key`.
    pub fn decrypt(
        &self,
        crypto: &dyn CryptoProvider,
        key: &KeySecret,
        nonce_material: &[u8],
    ) -> Option<Result<Vec<Change>>> {
        match self {
            Transaction::Trusting { .. } => None,
            Transaction::Private {
                encrypted_changes, ..
            } => {
                let plaintext = crypto.decrypt(key, nonce_material, encrypted_changes)?;
                Some(decode_changes(&plaintext))
            }
        }
    }
}

fn check_size(size: usize) -> Result<()> {
    if size > MAX_TRANSACTION_SIZE {
        return Err(CoreError::TransactionTooLarge {
            size,
            limit: MAX_TRANSACTION_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AgentSecret, DefaultCrypto};
    use crate::types::SessionId;
    use serde_json::json;

    fn tx_id() -> TransactionId {
        let agent = DefaultCrypto.agent_id(&AgentSecret::from_seed(&[1; 32]));
        TransactionId {
            session: SessionId { agent, nonce: 7 },
            index: 0,
        }
    }

    #[test]
    fn test_changes_roundtrip() {
        let changes = vec![
            Change::MapSet {
                key: "x".into(),
                value: json!({"nested": [1, 2, "three"]}),
            },
            Change::MapDelete { key: "y".into() },
            Change::ListInsert {
                after: ListAnchor::Start,
                value: json!("a"),
            },
            Change::BinaryChunk {
                data: Bytes::from_static(b"\x00\x01"),
            },
            Change::BinaryEnd,
        ];
        let tx = Transaction::trusting(10, &changes).unwrap();
        assert_eq!(tx.made_at(), 10);
        assert_eq!(tx.decode_trusting().unwrap().unwrap(), changes);
    }

    #[test]
    fn test_oversized_transaction_rejected() {
        let big = "x".repeat(MAX_TRANSACTION_SIZE + 1);
        let err = Transaction::trusting(
            0,
            &[Change::MapSet {
                key: "k".into(),
                value: json!(big),
            }],
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::TransactionTooLarge { limit, .. } if limit == MAX_TRANSACTION_SIZE));
    }

    #[test]
    fn test_private_roundtrip() {
        let crypto = DefaultCrypto;
        let key = crypto.new_key_secret();
        let value = ValueId::from_bytes([3; 32]);
        let nonce = nonce_material(&value, &tx_id());
        let changes = vec![Change::StreamPush { value: json!(42) }];

        let tx = Transaction::private(&crypto, &key, &nonce, 5, &changes).unwrap();
        assert!(tx.is_private());
        assert_eq!(tx.key_id(), Some(key.id()));
        assert!(tx.decode_trusting().is_none());

        let opened = tx.decrypt(&crypto, &key, &nonce).unwrap().unwrap();
        assert_eq!(opened, changes);

        let wrong = crypto.new_key_secret();
        assert!(tx.decrypt(&crypto, &wrong, &nonce).is_none());
    }

    #[test]
    fn test_nonce_material_differs_per_index() {
        let value = ValueId::from_bytes([3; 32]);
        let a = tx_id();
        let mut b = a;
        b.index = 1;
        assert_ne!(nonce_material(&value, &a), nonce_material(&value, &b));
    }
}
