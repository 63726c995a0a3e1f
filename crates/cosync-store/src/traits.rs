//! Driver traits: the abstract interface for log persistence.
//!
//! A driver exposes eight primitive operations inside a transaction. The
//! load/store logic in [`crate::storage`] is written once against
//! [`StorageTx`] and works with every driver.

use async_trait::async_trait;
use cosync_core::{SessionId, Signature, Transaction, ValueHeader, ValueId};

use crate::error::Result;

/// A stored value row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub row_id: i64,
    pub id: ValueId,
    pub header: ValueHeader,
}

/// A stored session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub row_id: i64,
    pub value_row: i64,
    pub session: SessionId,
    /// Number of stored transactions.
    pub last_index: u32,
    /// Signature after the last stored transaction.
    pub last_signature: Signature,
    pub bytes_since_last_signature: u64,
}

/// Insert-or-update payload for a session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub value_row: i64,
    pub session: SessionId,
    pub last_index: u32,
    pub last_signature: Signature,
    pub bytes_since_last_signature: u64,
}

/// A stored transaction with its index in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTransaction {
    pub idx: u32,
    pub tx: Transaction,
}

/// A retained signature at a checkpoint index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCheckpoint {
    pub idx: u32,
    pub signature: Signature,
}

/// Operations available inside one storage transaction.
pub trait StorageTx {
    fn get_value(&mut self, id: &ValueId) -> Result<Option<StoredValue>>;

    fn get_sessions(&mut self, value_row: i64) -> Result<Vec<StoredSession>>;

    /// Transactions with `from <= idx < to`, ordered by index.
    fn get_transactions_in_range(
        &mut self,
        session_row: i64,
        from: u32,
        to: u32,
    ) -> Result<Vec<StoredTransaction>>;

    /// Checkpoints with `idx >= from`, ordered by index.
    fn get_signatures_after(&mut self, session_row: i64, from: u32) -> Result<Vec<StoredCheckpoint>>;

    /// Insert a value row and return its row id.
    fn add_value(&mut self, id: &ValueId, header: &ValueHeader) -> Result<i64>;

    /// Insert or update a session row and return its row id.
    fn add_or_update_session(&mut self, update: &SessionUpdate) -> Result<i64>;

    fn add_transaction(&mut self, session_row: i64, idx: u32, tx: &Transaction) -> Result<()>;

    fn add_signature_checkpoint(
        &mut self,
        session_row: i64,
        idx: u32,
        signature: &Signature,
    ) -> Result<()>;
}

/// A driver with synchronous transactions.
///
/// The callback's writes are committed if it returns `Ok` and rolled back
/// otherwise.
pub trait StorageDriver: Send + Sync {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StorageTx) -> Result<T>;
}

/// A driver whose transactions run off the async runtime.
#[async_trait]
pub trait AsyncStorageDriver: Send + Sync + 'static {
    async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StorageTx) -> Result<T> + Send + 'static,
        T: Send + 'static;
}
