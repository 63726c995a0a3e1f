//! Session logs: per-agent, append-only transaction chains.
//!
//! Each session keeps a running hash over its transactions:
//!
//! ```text
//! h_0 = ZERO
//! h_i = H("cosync-session-v0:" || h_{i-1} || canonical(tx_i))
//! ```
//!
//! A signature over `h_i` vouches for every transaction up to index `i`. Pieces
//! of content carry the signature of their last transaction, so a receiver
//! verifies one signature per piece. When more than [`CHECKPOINT_BYTES`] have
//! accumulated since the last retained signature, the current signature is
//! kept as a checkpoint and outgoing content is split there.

use std::collections::BTreeMap;

use crate::canonical::canonical_transaction_bytes;
use crate::crypto::{CryptoProvider, Hash, SignerSecret, Signature};
use crate::error::{CoreError, Result};
use crate::transaction::Transaction;
use crate::types::SessionId;

/// Bytes of transaction payload between retained signatures.
pub const CHECKPOINT_BYTES: usize = 100 * 1024;

const CHAIN_DOMAIN: &[u8] = b"cosync-session-v0:";

/// Extend a hash chain by one transaction.
pub fn chain_hash(crypto: &dyn CryptoProvider, prev: &Hash, tx: &Transaction) -> Hash {
    let tx_bytes = canonical_transaction_bytes(tx);
    let mut buf = Vec::with_capacity(CHAIN_DOMAIN.len() + 32 + tx_bytes.len());
    buf.extend_from_slice(CHAIN_DOMAIN);
    buf.extend_from_slice(prev.as_bytes());
    buf.extend_from_slice(&tx_bytes);
    crypto.hash(&buf)
}

/// Outcome of adding transactions to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// This many new transactions were appended.
    Added(usize),
    /// Everything offered was already present.
    AlreadyKnown,
}

/// One session's transactions plus its signature bookkeeping.
#[derive(Debug, Clone)]
pub struct SessionLog {
    id: SessionId,
    transactions: Vec<Transaction>,
    last_hash: Hash,
    last_signature: Option<Signature>,
    /// Retained signatures keyed by the index of the last transaction they cover.
    checkpoints: BTreeMap<u32, Signature>,
    bytes_since_checkpoint: usize,
}

impl SessionLog {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            transactions: Vec::new(),
            last_hash: Hash::ZERO,
            last_signature: None,
            checkpoints: BTreeMap::new(),
            bytes_since_checkpoint: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn get(&self, index: u32) -> Option<&Transaction> {
        self.transactions.get(index as usize)
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    pub fn last_hash(&self) -> Hash {
        self.last_hash
    }

    pub fn checkpoints(&self) -> &BTreeMap<u32, Signature> {
        &self.checkpoints
    }

    pub fn bytes_since_checkpoint(&self) -> usize {
        self.bytes_since_checkpoint
    }

    /// Latest `made_at` in this session, used to keep local timestamps monotonic.
    pub fn last_made_at(&self) -> Option<u64> {
        self.transactions.last().map(Transaction::made_at)
    }

    /// Add transactions starting after `after` existing ones.
    ///
    /// The already-known prefix is skipped without re-verification. A gap
    /// (`after` beyond the local length) is a [`CoreError::MissingPrefix`]. The
    /// signature must cover the hash after the last offered transaction.
    pub fn try_add(
        &mut self,
        crypto: &dyn CryptoProvider,
        after: u32,
        new_transactions: &[Transaction],
        signature: &Signature,
    ) -> Result<AppendOutcome> {
        let known = self.len();
        if after > known {
            return Err(CoreError::MissingPrefix {
                session: self.id,
                known,
                after,
            });
        }

        let overlap = (known - after) as usize;
        if overlap >= new_transactions.len() {
            return Ok(AppendOutcome::AlreadyKnown);
        }
        let fresh = &new_transactions[overlap..];

        let mut hash = self.last_hash;
        for tx in fresh {
            hash = chain_hash(crypto, &hash, tx);
        }

        if !crypto.verify(signature, hash.as_bytes(), &self.id.agent.signer) {
            return Err(CoreError::InvalidSignature(self.id));
        }

        self.commit(fresh.to_vec(), hash, *signature);
        Ok(AppendOutcome::Added(fresh.len()))
    }

    /// Sign and append a locally created transaction.
    pub fn append_signed(
        &mut self,
        crypto: &dyn CryptoProvider,
        secret: &SignerSecret,
        tx: Transaction,
    ) -> Signature {
        let hash = chain_hash(crypto, &self.last_hash, &tx);
        let signature = crypto.sign(secret, hash.as_bytes());
        self.commit(vec![tx], hash, signature);
        signature
    }

    /// Restore a session from storage without re-verifying.
    ///
    /// `checkpoints` are the signatures persisted alongside the log.
    pub fn restore(
        crypto: &dyn CryptoProvider,
        id: SessionId,
        transactions: Vec<Transaction>,
        last_signature: Signature,
        checkpoints: BTreeMap<u32, Signature>,
        bytes_since_checkpoint: usize,
    ) -> Self {
        let mut hash = Hash::ZERO;
        for tx in &transactions {
            hash = chain_hash(crypto, &hash, tx);
        }
        Self {
            id,
            transactions,
            last_hash: hash,
            last_signature: Some(last_signature),
            checkpoints,
            bytes_since_checkpoint,
        }
    }

    fn commit(&mut self, txs: Vec<Transaction>, hash: Hash, signature: Signature) {
        self.bytes_since_checkpoint += txs.iter().map(Transaction::byte_size).sum::<usize>();
        self.transactions.extend(txs);
        self.last_hash = hash;
        self.last_signature = Some(signature);

        if self.bytes_since_checkpoint > CHECKPOINT_BYTES {
            self.checkpoints.insert(self.len() - 1, signature);
            self.bytes_since_checkpoint = 0;
        }
    }

    /// Split `from..len` into signed pieces at retained checkpoints.
    ///
    /// Each piece is `(after, end_exclusive, signature)`.
    pub fn pieces_since(&self, from: u32) -> Vec<(u32, u32, Signature)> {
        let mut pieces = Vec::new();
        let Some(last_signature) = self.last_signature else {
            return pieces;
        };
        let mut start = from;
        for (&index, signature) in self.checkpoints.range(from..) {
            if index + 1 >= self.len() {
                break;
            }
            pieces.push((start, index + 1, *signature));
            start = index + 1;
        }
        if start < self.len() {
            pieces.push((start, self.len(), last_signature));
        }
        pieces
    }
}
