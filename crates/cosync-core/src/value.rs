//! Value cores: one header plus every known session log.
//!
//! A [`ValueCore`] is pure data. It verifies signatures as content arrives and
//! produces content messages for peers, but knows nothing about permissions;
//! deciding which transactions count is left to the permission layer, which
//! reads [`ValueCore::ordered_entries`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::crypto::{AgentSecret, CryptoProvider, Signature};
use crate::error::{CoreError, Result};
use crate::header::{ValueHeader, ValueKind};
use crate::known::KnownState;
use crate::session::{AppendOutcome, SessionLog};
use crate::transaction::{Change, Transaction};
use crate::types::{SessionId, TransactionId, ValueId};

/// New transactions for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNewContent {
    /// Number of transactions the sender assumes the receiver already has.
    pub after: u32,
    pub new_transactions: Vec<Transaction>,
    /// Signature over the chain hash after the last new transaction.
    pub last_signature: Signature,
}

/// A batch of new content for one value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMessage {
    pub id: ValueId,
    pub header: Option<ValueHeader>,
    pub new: BTreeMap<SessionId, SessionNewContent>,
}

impl ContentMessage {
    pub fn new(id: ValueId) -> Self {
        Self {
            id,
            header: None,
            new: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.is_empty()
    }

    pub fn transaction_count(&self) -> usize {
        self.new.values().map(|s| s.new_transactions.len()).sum()
    }

    /// Known state a receiver has after applying this message on top of
    /// exactly the prefixes it assumes.
    pub fn resulting_known(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: self.header.is_some(),
            sessions: self
                .new
                .iter()
                .map(|(s, c)| (*s, c.after + c.new_transactions.len() as u32))
                .collect(),
        }
    }
}

/// What happened when a content message was ingested.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Transactions appended across all sessions.
    pub added: usize,
    /// Sessions whose content started past what we hold.
    pub gaps: Vec<SessionId>,
    /// Sessions whose content failed verification.
    pub rejected: Vec<(SessionId, CoreError)>,
}

impl IngestReport {
    /// True when the sender's view of us is wrong and needs a correction.
    pub fn needs_correction(&self) -> bool {
        !self.gaps.is_empty()
    }
}

/// A transaction together with its position, for global ordering.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    pub tx: TransactionId,
    pub made_at: u64,
    pub transaction: &'a Transaction,
}

/// Header plus all known session logs of one value.
#[derive(Debug, Clone)]
pub struct ValueCore {
    id: ValueId,
    header: ValueHeader,
    sessions: BTreeMap<SessionId, SessionLog>,
    /// Transactions whose plaintext failed to decode. They stay in the log.
    invalid: HashSet<TransactionId>,
}

impl ValueCore {
    pub fn new(header: ValueHeader) -> Self {
        Self {
            id: header.id(),
            header,
            sessions: BTreeMap::new(),
            invalid: HashSet::new(),
        }
    }

    /// Create a core from a content message that carries the header.
    pub fn from_header_of(msg: &ContentMessage) -> Option<Result<Self>> {
        let header = msg.header.as_ref()?;
        if header.id() != msg.id {
            return Some(Err(CoreError::HeaderMismatch(msg.id)));
        }
        Some(Ok(Self::new(header.clone())))
    }

    pub fn id(&self) -> ValueId {
        self.id
    }

    pub fn header(&self) -> &ValueHeader {
        &self.header
    }

    pub fn kind(&self) -> ValueKind {
        self.header.kind
    }

    pub fn session(&self, id: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionLog> {
        self.sessions.values()
    }

    pub fn transaction_count(&self) -> usize {
        self.sessions.values().map(|s| s.len() as usize).sum()
    }

    /// Local truth: header plus the length of every session.
    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: true,
            sessions: self.sessions.iter().map(|(id, s)| (*id, s.len())).collect(),
        }
    }

    /// Add verified transactions to one session.
    pub fn try_add_transactions(
        &mut self,
        crypto: &dyn CryptoProvider,
        session: SessionId,
        after: u32,
        new_transactions: &[Transaction],
        signature: &Signature,
    ) -> Result<AppendOutcome> {
        let log = self
            .sessions
            .entry(session)
            .or_insert_with(|| SessionLog::new(session));
        let before = log.len();
        let outcome = log.try_add(crypto, after, new_transactions, signature);
        if log.is_empty() {
            self.sessions.remove(&session);
        }
        let outcome = outcome?;
        if let AppendOutcome::Added(n) = outcome {
            self.check_decodable(session, before, n);
        }
        Ok(outcome)
    }

    /// Sign and append a transaction authored locally.
    pub fn append_local(
        &mut self,
        crypto: &dyn CryptoProvider,
        secret: &AgentSecret,
        session: SessionId,
        tx: Transaction,
    ) -> Signature {
        let log = self
            .sessions
            .entry(session)
            .or_insert_with(|| SessionLog::new(session));
        let before = log.len();
        let signature = log.append_signed(crypto, &secret.signer, tx);
        self.check_decodable(session, before, 1);
        signature
    }

    /// Install a session restored from storage.
    pub fn restore_session(&mut self, log: SessionLog) {
        let session = log.id();
        let count = log.len() as usize;
        self.sessions.insert(session, log);
        self.check_decodable(session, 0, count);
    }

    /// Apply every session of a content message.
    ///
    /// Sessions are independent: a failure in one does not affect others.
    pub fn ingest(&mut self, crypto: &dyn CryptoProvider, msg: &ContentMessage) -> IngestReport {
        let mut report = IngestReport::default();
        for (session, content) in &msg.new {
            match self.try_add_transactions(
                crypto,
                *session,
                content.after,
                &content.new_transactions,
                &content.last_signature,
            ) {
                Ok(AppendOutcome::Added(n)) => report.added += n,
                Ok(AppendOutcome::AlreadyKnown) => {}
                Err(CoreError::MissingPrefix { .. }) => report.gaps.push(*session),
                Err(e) => {
                    tracing::debug!(value = %self.id, %session, error = %e, "rejected session content");
                    report.rejected.push((*session, e));
                }
            }
        }
        report
    }

    fn check_decodable(&mut self, session: SessionId, from: u32, count: usize) {
        let Some(log) = self.sessions.get(&session) else {
            return;
        };
        for (offset, tx) in log.transactions()[from as usize..][..count].iter().enumerate() {
            if let Some(Err(e)) = tx.decode_trusting() {
                let id = TransactionId {
                    session,
                    index: from + offset as u32,
                };
                tracing::debug!(value = %self.id, ?id, error = %e, "malformed transaction");
                self.invalid.insert(id);
            }
        }
    }

    /// True for transactions known to be malformed.
    pub fn is_invalid(&self, tx: &TransactionId) -> bool {
        self.invalid.contains(tx)
    }

    /// Remember a transaction as malformed so it is skipped next time.
    pub fn mark_invalid(&mut self, tx: TransactionId) {
        self.invalid.insert(tx);
    }

    /// Every transaction, sorted by (`made_at`, session id, index).
    pub fn ordered_entries(&self) -> Vec<Entry<'_>> {
        let mut entries: Vec<Entry<'_>> = self
            .sessions
            .iter()
            .flat_map(|(session, log)| {
                log.transactions()
                    .iter()
                    .enumerate()
                    .map(move |(index, transaction)| Entry {
                        tx: TransactionId {
                            session: *session,
                            index: index as u32,
                        },
                        made_at: transaction.made_at(),
                        transaction,
                    })
            })
            .collect();
        entries.sort_by_key(|e| (e.made_at, e.tx));
        entries
    }

    /// Decode a trusting entry unless it is known to be malformed.
    pub fn trusting_changes(&self, entry: &Entry<'_>) -> Option<Vec<Change>> {
        if self.is_invalid(&entry.tx) {
            return None;
        }
        entry.transaction.decode_trusting()?.ok()
    }

    /// A `made_at` for a new local transaction that never goes backwards
    /// within its session.
    pub fn next_made_at(&self, session: &SessionId, now: u64) -> u64 {
        let last = self
            .sessions
            .get(session)
            .and_then(SessionLog::last_made_at)
            .unwrap_or(0);
        now.max(last)
    }

    /// Content a peer with `known` is missing, split at signature checkpoints.
    ///
    /// The n-th message carries the n-th piece of every session, so messages
    /// must be delivered in order.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Vec<ContentMessage> {
        let needs_header = known.map_or(true, |k| !k.header);
        let mut messages: Vec<ContentMessage> = Vec::new();

        for (session, log) in &self.sessions {
            let from = known.map_or(0, |k| k.count(session));
            for (i, (after, end, signature)) in log.pieces_since(from).into_iter().enumerate() {
                if messages.len() <= i {
                    messages.push(ContentMessage::new(self.id));
                }
                messages[i].new.insert(
                    *session,
                    SessionNewContent {
                        after,
                        new_transactions: log.transactions()[after as usize..end as usize].to_vec(),
                        last_signature: signature,
                    },
                );
            }
        }

        if needs_header {
            if messages.is_empty() {
                messages.push(ContentMessage::new(self.id));
            }
            messages[0].header = Some(self.header.clone());
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{DecodedEntry, ValueContent};
    use crate::crypto::DefaultCrypto;
    use crate::header::Ruleset;
    use bytes::Bytes;
    use serde_json::json;

    struct Writer {
        secret: AgentSecret,
        session: SessionId,
    }

    fn writer(seed: u8) -> Writer {
        let secret = AgentSecret::from_seed(&[seed; 32]);
        let session = SessionId {
            agent: DefaultCrypto.agent_id(&secret),
            nonce: seed as u64,
        };
        Writer { secret, session }
    }

    fn set(made_at: u64, key: &str, value: serde_json::Value) -> Transaction {
        Transaction::trusting(made_at, &[Change::MapSet { key: key.into(), value }]).unwrap()
    }

    fn core() -> ValueCore {
        ValueCore::new(ValueHeader::new(ValueKind::Map, Ruleset::UnsafeAllowAll, 0))
    }

    fn content(core: &ValueCore) -> serde_json::Value {
        let entries: Vec<DecodedEntry> = core
            .ordered_entries()
            .iter()
            .filter_map(|e| {
                Some(DecodedEntry {
                    tx: e.tx,
                    made_at: e.made_at,
                    changes: core.trusting_changes(e)?,
                })
            })
            .collect();
        ValueContent::from_entries(core.kind(), &entries).to_json()
    }

    fn sync(from: &ValueCore, to: &mut ValueCore) {
        for msg in from.new_content_since(Some(&to.known_state())) {
            let report = to.ingest(&DefaultCrypto, &msg);
            assert!(report.rejected.is_empty());
            assert!(report.gaps.is_empty());
        }
    }

    #[test]
    fn test_new_content_for_unknown_peer_carries_header() {
        let a = writer(1);
        let mut local = core();
        local.append_local(&DefaultCrypto, &a.secret, a.session, set(1, "x", json!(1)));

        let msgs = local.new_content_since(None);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].header.as_ref(), Some(local.header()));

        let mut remote = ValueCore::from_header_of(&msgs[0]).unwrap().unwrap();
        remote.ingest(&DefaultCrypto, &msgs[0]);
        assert_eq!(remote.known_state(), local.known_state());
        assert!(local.new_content_since(Some(&remote.known_state())).is_empty());
    }

    #[test]
    fn test_header_mismatch_detected() {
        let local = core();
        let mut msg = local.new_content_since(None).remove(0);
        msg.id = ValueId::from_bytes([0; 32]);
        assert!(matches!(
            ValueCore::from_header_of(&msg),
            Some(Err(CoreError::HeaderMismatch(_)))
        ));
    }

    #[test]
    fn test_convergence_regardless_of_delivery_order() {
        let a = writer(1);
        let b = writer(2);
        let mut node_a = core();
        let mut node_b = ValueCore::new(node_a.header().clone());

        node_a.append_local(&DefaultCrypto, &a.secret, a.session, set(10, "x", json!(1)));
        node_b.append_local(&DefaultCrypto, &b.secret, b.session, set(20, "x", json!(2)));
        node_b.append_local(&DefaultCrypto, &b.secret, b.session, set(21, "y", json!("b")));

        sync(&node_a, &mut node_b);
        sync(&node_b, &mut node_a);

        assert_eq!(content(&node_a), content(&node_b));
        assert_eq!(content(&node_a), json!({"x": 2, "y": "b"}));
    }

    #[test]
    fn test_gap_reported() {
        let a = writer(1);
        let mut local = core();
        local.append_local(&DefaultCrypto, &a.secret, a.session, set(1, "x", json!(1)));
        local.append_local(&DefaultCrypto, &a.secret, a.session, set(2, "x", json!(2)));

        // Pretend the peer already has the first transaction
        let mut assumed = KnownState::empty(local.id());
        assumed.header = true;
        assumed.sessions.insert(a.session, 1);
        let msg = local.new_content_since(Some(&assumed)).remove(0);

        let mut remote = ValueCore::new(local.header().clone());
        let report = remote.ingest(&DefaultCrypto, &msg);
        assert!(report.needs_correction());
        assert_eq!(report.gaps, vec![a.session]);
        assert_eq!(remote.transaction_count(), 0);
    }

    #[test]
    fn test_tampered_content_rejected_per_session() {
        let a = writer(1);
        let b = writer(2);
        let mut local = core();
        local.append_local(&DefaultCrypto, &a.secret, a.session, set(1, "x", json!(1)));
        local.append_local(&DefaultCrypto, &b.secret, b.session, set(2, "y", json!(2)));

        let mut msg = local.new_content_since(None).remove(0);
        let piece = msg.new.get_mut(&a.session).unwrap();
        piece.new_transactions[0] = set(1, "x", json!(999));

        let mut remote = ValueCore::new(local.header().clone());
        let report = remote.ingest(&DefaultCrypto, &msg);
        assert_eq!(report.added, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(content(&remote), json!({"y": 2}));
    }

    #[test]
    fn test_malformed_transaction_cached_invalid() {
        let a = writer(1);
        let mut local = core();
        let garbage = Transaction::Trusting {
            made_at: 1,
            changes: Bytes::from_static(b"\xff\xff"),
            meta: None,
        };
        local.append_local(&DefaultCrypto, &a.secret, a.session, garbage);
        local.append_local(&DefaultCrypto, &a.secret, a.session, set(2, "x", json!(1)));

        let id = TransactionId {
            session: a.session,
            index: 0,
        };
        assert!(local.is_invalid(&id));
        // Kept in the log so peers agree on bytes
        assert_eq!(local.transaction_count(), 2);
        assert_eq!(content(&local), json!({"x": 1}));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let a = writer(1);
        let mut local = core();
        local.append_local(&DefaultCrypto, &a.secret, a.session, set(1, "x", json!(1)));
        let msgs = local.new_content_since(None);

        let mut remote = ValueCore::new(local.header().clone());
        for _ in 0..3 {
            for msg in &msgs {
                remote.ingest(&DefaultCrypto, msg);
            }
        }
        assert_eq!(remote.transaction_count(), 1);
        assert_eq!(content(&remote), content(&local));
    }

    #[test]
    fn test_ordered_entries_tie_break() {
        let a = writer(1);
        let b = writer(2);
        let mut local = core();
        local.append_local(&DefaultCrypto, &b.secret, b.session, set(5, "x", json!("b")));
        local.append_local(&DefaultCrypto, &a.secret, a.session, set(5, "x", json!("a")));

        let order: Vec<SessionId> = local.ordered_entries().iter().map(|e| e.tx.session).collect();
        let mut expected = vec![a.session, b.session];
        expected.sort();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_next_made_at_is_monotonic() {
        let a = writer(1);
        let mut local = core();
        local.append_local(&DefaultCrypto, &a.secret, a.session, set(100, "x", json!(1)));
        assert_eq!(local.next_made_at(&a.session, 50), 100);
        assert_eq!(local.next_made_at(&a.session, 150), 150);
    }
}
