//! In-memory storage driver.
//!
//! Same semantics as SQLite, nothing persisted. A transaction works on a copy
//! of the tables that replaces the original only on success.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use cosync_core::{SessionId, Signature, Transaction, ValueHeader, ValueId};

use crate::error::{Result, StoreError};
use crate::traits::{
    AsyncStorageDriver, SessionUpdate, StorageDriver, StorageTx, StoredCheckpoint,
    StoredSession, StoredTransaction, StoredValue,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    next_row: i64,
    values: HashMap<ValueId, (i64, ValueHeader)>,
    sessions: BTreeMap<(i64, SessionId), StoredSession>,
    transactions: BTreeMap<(i64, u32), Transaction>,
    checkpoints: BTreeMap<(i64, u32), Signature>,
}

impl Tables {
    fn next_row(&mut self) -> i64 {
        self.next_row += 1;
        self.next_row
    }
}

/// In-memory driver.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    inner: RwLock<Tables>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageDriver for MemoryDriver {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StorageTx) -> Result<T>,
    {
        let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        let mut working = inner.clone();
        let value = f(&mut working)?;
        *inner = working;
        Ok(value)
    }
}

#[async_trait]
impl AsyncStorageDriver for MemoryDriver {
    async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StorageTx) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        StorageDriver::transaction(self, f)
    }
}

impl StorageTx for Tables {
    fn get_value(&mut self, id: &ValueId) -> Result<Option<StoredValue>> {
        Ok(self.values.get(id).map(|(row_id, header)| StoredValue {
            row_id: *row_id,
            id: *id,
            header: header.clone(),
        }))
    }

    fn get_sessions(&mut self, value_row: i64) -> Result<Vec<StoredSession>> {
        Ok(self
            .sessions
            .iter()
            .filter(|((row, _), _)| *row == value_row)
            .map(|(_, session)| session.clone())
            .collect())
    }

    fn get_transactions_in_range(
        &mut self,
        session_row: i64,
        from: u32,
        to: u32,
    ) -> Result<Vec<StoredTransaction>> {
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(self
            .transactions
            .range((session_row, from)..(session_row, to))
            .map(|((_, idx), tx)| StoredTransaction {
                idx: *idx,
                tx: tx.clone(),
            })
            .collect())
    }

    fn get_signatures_after(&mut self, session_row: i64, from: u32) -> Result<Vec<StoredCheckpoint>> {
        Ok(self
            .checkpoints
            .range((session_row, from)..=(session_row, u32::MAX))
            .map(|((_, idx), signature)| StoredCheckpoint {
                idx: *idx,
                signature: *signature,
            })
            .collect())
    }

    fn add_value(&mut self, id: &ValueId, header: &ValueHeader) -> Result<i64> {
        if self.values.contains_key(id) {
            return Err(StoreError::InvalidData(format!("value {id} already stored")));
        }
        let row = self.next_row();
        self.values.insert(*id, (row, header.clone()));
        Ok(row)
    }

    fn add_or_update_session(&mut self, update: &SessionUpdate) -> Result<i64> {
        let key = (update.value_row, update.session);
        let row_id = match self.sessions.get(&key) {
            Some(existing) => existing.row_id,
            None => self.next_row(),
        };
        self.sessions.insert(
            key,
            StoredSession {
                row_id,
                value_row: update.value_row,
                session: update.session,
                last_index: update.last_index,
                last_signature: update.last_signature,
                bytes_since_last_signature: update.bytes_since_last_signature,
            },
        );
        Ok(row_id)
    }

    fn add_transaction(&mut self, session_row: i64, idx: u32, tx: &Transaction) -> Result<()> {
        if self.transactions.contains_key(&(session_row, idx)) {
            return Err(StoreError::InvalidData(format!(
                "transaction {idx} of session row {session_row} already stored"
            )));
        }
        self.transactions.insert((session_row, idx), tx.clone());
        Ok(())
    }

    fn add_signature_checkpoint(
        &mut self,
        session_row: i64,
        idx: u32,
        signature: &Signature,
    ) -> Result<()> {
        self.checkpoints.insert((session_row, idx), *signature);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosync_core::{AgentSecret, CryptoProvider, DefaultCrypto, Ruleset, ValueKind};

    #[test]
    fn test_rollback_on_error() {
        let driver = MemoryDriver::new();
        let header = ValueHeader::new(ValueKind::Map, Ruleset::UnsafeAllowAll, 0);
        let id = header.id();

        let result: Result<()> = StorageDriver::transaction(&driver, |tx| {
            tx.add_value(&id, &header)?;
            Err(StoreError::InvalidData("abort".into()))
        });
        assert!(result.is_err());
        assert!(StorageDriver::transaction(&driver, |tx| tx.get_value(&id))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_sessions_scoped_to_value() {
        let driver = MemoryDriver::new();
        let a = ValueHeader::new(ValueKind::Map, Ruleset::UnsafeAllowAll, 0);
        let b = ValueHeader::new(ValueKind::Map, Ruleset::UnsafeAllowAll, 0);
        let session = SessionId {
            agent: DefaultCrypto.agent_id(&AgentSecret::from_seed(&[1; 32])),
            nonce: 1,
        };

        let (sessions_a, sessions_b) = StorageDriver::transaction(&driver, |tx| {
            let row_a = tx.add_value(&a.id(), &a)?;
            let row_b = tx.add_value(&b.id(), &b)?;
            tx.add_or_update_session(&SessionUpdate {
                value_row: row_a,
                session,
                last_index: 1,
                last_signature: Signature([0; 64]),
                bytes_since_last_signature: 0,
            })?;
            Ok((tx.get_sessions(row_a)?, tx.get_sessions(row_b)?))
        })
        .unwrap();
        assert_eq!(sessions_a.len(), 1);
        assert!(sessions_b.is_empty());
    }

    #[test]
    fn test_duplicate_value_rejected() {
        let driver = MemoryDriver::new();
        let header = ValueHeader::new(ValueKind::Map, Ruleset::UnsafeAllowAll, 0);
        let id = header.id();
        StorageDriver::transaction(&driver, |tx| tx.add_value(&id, &header)).unwrap();
        assert!(StorageDriver::transaction(&driver, |tx| tx.add_value(&id, &header)).is_err());
    }
}
