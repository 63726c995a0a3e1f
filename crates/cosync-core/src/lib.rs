//! # cosync core
//!
//! Pure primitives for cosync: value headers, session logs, known state and
//! merged CRDT content.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over signed, content-addressed data structures.
//!
//! ## Key Types
//!
//! - [`ValueHeader`] - Immutable header; its hash is the [`ValueId`]
//! - [`Transaction`] - One atomic batch of [`Change`]s, trusting or private
//! - [`SessionLog`] - One agent session's signed transaction chain
//! - [`ValueCore`] - A header plus all known sessions
//! - [`KnownState`] - How much of a value someone holds
//! - [`ValueContent`] - Deterministically merged content
//! - [`CryptoProvider`] - Signing, encryption and hashing
//!
//! ## Canonicalization
//!
//! Headers and transactions are hashed over deterministic CBOR. See the
//! [`canonical`] module.

pub mod canonical;
pub mod content;
pub mod crypto;
pub mod error;
pub mod header;
pub mod known;
pub mod session;
pub mod transaction;
pub mod types;
pub mod validation;
pub mod value;

pub use canonical::{canonical_header_bytes, canonical_transaction_bytes};
pub use content::{
    BinaryContent, DecodedEntry, ListContent, MapContent, StreamContent, ValueContent,
};
pub use crypto::{
    AgentSecret, CryptoProvider, DefaultCrypto, Hash, KeySecret, SealerId, SealerSecret,
    SignerId, SignerSecret, Signature,
};
pub use error::{CoreError, Result, ValidationError};
pub use header::{HeaderMeta, Ruleset, ValueHeader, ValueKind};
pub use known::KnownState;
pub use session::{AppendOutcome, SessionLog, CHECKPOINT_BYTES};
pub use transaction::{
    nonce_material, Change, ListAnchor, Transaction, MAX_TRANSACTION_SIZE,
};
pub use types::{AgentId, KeyId, OpId, SessionId, TransactionId, ValueId};
pub use validation::{validate_content, validate_header};
pub use value::{ContentMessage, Entry, IngestReport, SessionNewContent, ValueCore};
