//! Checkpointed load and store of value logs.
//!
//! Storing a content message appends each session's new transactions and
//! keeps the signature of the last one. Whenever more than
//! `checkpoint_bytes` of transactions accumulate since the last retained
//! signature, that signature is kept as a checkpoint. Loading rebuilds
//! content messages split at those checkpoints, so each piece carries a
//! signature covering exactly its end.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cosync_core::{ContentMessage, KnownState, SessionNewContent, ValueId, CHECKPOINT_BYTES};

use crate::error::Result;
use crate::limiter::ParallelOpsLimiter;
use crate::traits::{AsyncStorageDriver, SessionUpdate, StorageDriver, StorageTx};

/// Storage tuning.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Bytes of transactions after which a signature is retained.
    pub checkpoint_bytes: u64,
    /// Maximum concurrent writes for async storage.
    pub max_parallel_writes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_bytes: CHECKPOINT_BYTES as u64,
            max_parallel_writes: 16,
        }
    }
}

/// Result of storing a content message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Everything was stored (or already present).
    Stored(KnownState),
    /// The message assumed more than storage holds, or lacked a header for
    /// an unknown value. Carries what storage actually has.
    Mismatch(KnownState),
}

impl StoreOutcome {
    pub fn known(&self) -> &KnownState {
        match self {
            StoreOutcome::Stored(known) | StoreOutcome::Mismatch(known) => known,
        }
    }
}

/// Object-safe storage interface used by the storage peer.
#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Content messages for a stored value, header first, in delivery order.
    async fn load(&self, id: ValueId) -> Result<Option<Vec<ContentMessage>>>;

    async fn store(&self, msg: ContentMessage) -> Result<StoreOutcome>;

    /// Limiter bounding concurrent writes, if this store has one.
    ///
    /// Callers that take a slot here themselves use
    /// [`ValueStore::store_admitted`] while holding it.
    fn write_limiter(&self) -> Option<ParallelOpsLimiter> {
        None
    }

    /// Store while the caller holds a slot from [`ValueStore::write_limiter`].
    async fn store_admitted(&self, msg: ContentMessage) -> Result<StoreOutcome> {
        self.store(msg).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared logic
// ─────────────────────────────────────────────────────────────────────────────

fn stored_known(tx: &mut dyn StorageTx, id: ValueId, value_row: i64) -> Result<KnownState> {
    Ok(KnownState {
        id,
        header: true,
        sessions: tx
            .get_sessions(value_row)?
            .into_iter()
            .map(|s| (s.session, s.last_index))
            .collect(),
    })
}

/// Store one content message inside a storage transaction.
pub fn store_message(
    tx: &mut dyn StorageTx,
    msg: &ContentMessage,
    checkpoint_bytes: u64,
) -> Result<StoreOutcome> {
    let value_row = match tx.get_value(&msg.id)? {
        Some(value) => value.row_id,
        None => match &msg.header {
            Some(header) => tx.add_value(&msg.id, header)?,
            None => return Ok(StoreOutcome::Mismatch(KnownState::empty(msg.id))),
        },
    };

    let existing: BTreeMap<_, _> = tx
        .get_sessions(value_row)?
        .into_iter()
        .map(|s| (s.session, s))
        .collect();

    let mut mismatch = false;
    for (session, piece) in &msg.new {
        let stored = existing.get(session);
        let have = stored.map_or(0, |s| s.last_index);
        let end = piece.after + piece.new_transactions.len() as u32;

        if piece.after > have {
            tracing::debug!(value = %msg.id, %session, have, after = piece.after, "storage is missing a prefix");
            mismatch = true;
            continue;
        }
        if end <= have {
            continue;
        }

        let new = &piece.new_transactions[(have - piece.after) as usize..];
        let bytes = stored.map_or(0, |s| s.bytes_since_last_signature)
            + new.iter().map(|t| t.byte_size() as u64).sum::<u64>();
        let checkpoint = bytes > checkpoint_bytes;

        let session_row = tx.add_or_update_session(&SessionUpdate {
            value_row,
            session: *session,
            last_index: end,
            last_signature: piece.last_signature,
            bytes_since_last_signature: if checkpoint { 0 } else { bytes },
        })?;
        for (offset, transaction) in new.iter().enumerate() {
            tx.add_transaction(session_row, have + offset as u32, transaction)?;
        }
        if checkpoint {
            tx.add_signature_checkpoint(session_row, end - 1, &piece.last_signature)?;
        }
    }

    let known = stored_known(tx, msg.id, value_row)?;
    Ok(if mismatch {
        StoreOutcome::Mismatch(known)
    } else {
        StoreOutcome::Stored(known)
    })
}

/// Load a value as content messages split at checkpoints.
pub fn load_value(tx: &mut dyn StorageTx, id: &ValueId) -> Result<Option<Vec<ContentMessage>>> {
    let Some(value) = tx.get_value(id)? else {
        return Ok(None);
    };

    let mut first = ContentMessage::new(*id);
    first.header = Some(value.header);
    let mut messages = vec![first];

    for session in tx.get_sessions(value.row_id)? {
        let mut pieces = Vec::new();
        let mut start = 0u32;
        for checkpoint in tx.get_signatures_after(session.row_id, 0)? {
            if checkpoint.idx >= start && checkpoint.idx + 1 < session.last_index {
                pieces.push((start, checkpoint.idx + 1, checkpoint.signature));
                start = checkpoint.idx + 1;
            }
        }
        if start < session.last_index {
            pieces.push((start, session.last_index, session.last_signature));
        }

        for (i, (from, to, signature)) in pieces.into_iter().enumerate() {
            let transactions = tx.get_transactions_in_range(session.row_id, from, to)?;
            if transactions.len() != (to - from) as usize {
                return Err(crate::StoreError::InvalidData(format!(
                    "session {} of {id} is missing transactions in {from}..{to}",
                    session.session
                )));
            }
            if messages.len() <= i {
                messages.push(ContentMessage::new(*id));
            }
            messages[i].new.insert(
                session.session,
                SessionNewContent {
                    after: from,
                    new_transactions: transactions.into_iter().map(|t| t.tx).collect(),
                    last_signature: signature,
                },
            );
        }
    }

    Ok(Some(messages))
}

// ─────────────────────────────────────────────────────────────────────────────
// Front ends
// ─────────────────────────────────────────────────────────────────────────────

/// Storage over a synchronous driver.
pub struct SyncStorage<D> {
    driver: Arc<D>,
    config: StorageConfig,
}

impl<D: StorageDriver> SyncStorage<D> {
    pub fn new(driver: D, config: StorageConfig) -> Self {
        Self {
            driver: Arc::new(driver),
            config,
        }
    }

    pub fn load(&self, id: &ValueId) -> Result<Option<Vec<ContentMessage>>> {
        self.driver.transaction(|tx| load_value(tx, id))
    }

    pub fn store(&self, msg: &ContentMessage) -> Result<StoreOutcome> {
        let checkpoint_bytes = self.config.checkpoint_bytes;
        self.driver
            .transaction(|tx| store_message(tx, msg, checkpoint_bytes))
    }
}

#[async_trait]
impl<D: StorageDriver + 'static> ValueStore for SyncStorage<D> {
    async fn load(&self, id: ValueId) -> Result<Option<Vec<ContentMessage>>> {
        SyncStorage::load(self, &id)
    }

    async fn store(&self, msg: ContentMessage) -> Result<StoreOutcome> {
        SyncStorage::store(self, &msg)
    }
}

/// Storage over an async driver, with bounded parallel writes.
pub struct AsyncStorage<D> {
    driver: Arc<D>,
    config: StorageConfig,
    limiter: ParallelOpsLimiter,
}

impl<D: AsyncStorageDriver> AsyncStorage<D> {
    pub fn new(driver: D, config: StorageConfig) -> Self {
        let limiter = ParallelOpsLimiter::new(config.max_parallel_writes);
        Self {
            driver: Arc::new(driver),
            config,
            limiter,
        }
    }

    pub fn limiter(&self) -> &ParallelOpsLimiter {
        &self.limiter
    }
}

#[async_trait]
impl<D: AsyncStorageDriver> ValueStore for AsyncStorage<D> {
    async fn load(&self, id: ValueId) -> Result<Option<Vec<ContentMessage>>> {
        self.driver.transaction(move |tx| load_value(tx, &id)).await
    }

    async fn store(&self, msg: ContentMessage) -> Result<StoreOutcome> {
        let _permit = self.limiter.acquire().await?;
        self.store_admitted(msg).await
    }

    fn write_limiter(&self) -> Option<ParallelOpsLimiter> {
        Some(self.limiter.clone())
    }

    async fn store_admitted(&self, msg: ContentMessage) -> Result<StoreOutcome> {
        let checkpoint_bytes = self.config.checkpoint_bytes;
        self.driver
            .transaction(move |tx| store_message(tx, &msg, checkpoint_bytes))
            .await
    }
}
