//! SQLite storage driver.
//!
//! Uses rusqlite with bundled SQLite. Synchronous transactions run on the
//! caller's thread; the async driver moves them onto `spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use cosync_core::{SessionId, Signature, Transaction, ValueHeader, ValueId};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    AsyncStorageDriver, SessionUpdate, StorageDriver, StorageTx, StoredCheckpoint,
    StoredSession, StoredTransaction, StoredValue,
};

/// SQLite-backed driver.
///
/// Thread-safe via internal Mutex; one transaction runs at a time.
#[derive(Clone)]
pub struct SqliteDriver {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDriver {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file if needed and runs pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn run_transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&mut dyn StorageTx) -> Result<T>,
{
    let tx = conn.transaction()?;
    let result = f(&mut SqliteTx { conn: &tx });
    match result {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        // Dropping the transaction rolls it back
        Err(e) => Err(e),
    }
}

impl StorageDriver for SqliteDriver {
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StorageTx) -> Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        run_transaction(&mut conn, f)
    }
}

#[async_trait]
impl AsyncStorageDriver for SqliteDriver {
    async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StorageTx) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            run_transaction(&mut conn, f)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding helpers
// ─────────────────────────────────────────────────────────────────────────────

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn signature_from(bytes: &[u8]) -> Result<Signature> {
    Signature::from_slice(bytes)
        .ok_or_else(|| StoreError::InvalidData(format!("signature of {} bytes", bytes.len())))
}

fn value_id_from(bytes: Vec<u8>) -> Result<ValueId> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| StoreError::InvalidData("value id is not 32 bytes".into()))?;
    Ok(ValueId::from_bytes(arr))
}

/// [`StorageTx`] over an open SQLite transaction.
struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl StorageTx for SqliteTx<'_> {
    fn get_value(&mut self, id: &ValueId) -> Result<Option<StoredValue>> {
        let row: Option<(i64, Vec<u8>, Vec<u8>)> = self
            .conn
            .query_row(
                r#"SELECT row_id, id, header FROM "values" WHERE id = ?1"#,
                params![id.as_bytes().as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(row_id, id, header)| {
            Ok(StoredValue {
                row_id,
                id: value_id_from(id)?,
                header: decode::<ValueHeader>(&header)?,
            })
        })
        .transpose()
    }

    fn get_sessions(&mut self, value_row: i64) -> Result<Vec<StoredSession>> {
        let mut stmt = self.conn.prepare(
            "SELECT row_id, session_id, last_index, last_signature, bytes_since_last_signature
             FROM sessions WHERE value_id = ?1 ORDER BY session_id",
        )?;
        let rows = stmt
            .query_map(params![value_row], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(row_id, session, last_index, signature, bytes)| {
                Ok(StoredSession {
                    row_id,
                    value_row,
                    session: session
                        .parse::<SessionId>()
                        .map_err(|e| StoreError::InvalidData(e.to_string()))?,
                    last_index,
                    last_signature: signature_from(&signature)?,
                    bytes_since_last_signature: bytes as u64,
                })
            })
            .collect()
    }

    fn get_transactions_in_range(
        &mut self,
        session_row: i64,
        from: u32,
        to: u32,
    ) -> Result<Vec<StoredTransaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT idx, payload FROM transactions
             WHERE session_row = ?1 AND idx >= ?2 AND idx < ?3
             ORDER BY idx",
        )?;
        let rows = stmt
            .query_map(params![session_row, from, to], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(idx, payload)| {
                Ok(StoredTransaction {
                    idx,
                    tx: decode::<Transaction>(&payload)?,
                })
            })
            .collect()
    }

    fn get_signatures_after(&mut self, session_row: i64, from: u32) -> Result<Vec<StoredCheckpoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT idx, signature FROM signature_checkpoints
             WHERE session_row = ?1 AND idx >= ?2
             ORDER BY idx",
        )?;
        let rows = stmt
            .query_map(params![session_row, from], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(idx, signature)| {
                Ok(StoredCheckpoint {
                    idx,
                    signature: signature_from(&signature)?,
                })
            })
            .collect()
    }

    fn add_value(&mut self, id: &ValueId, header: &ValueHeader) -> Result<i64> {
        self.conn.execute(
            r#"INSERT INTO "values" (id, header) VALUES (?1, ?2)"#,
            params![id.as_bytes().as_slice(), encode(header)?],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn add_or_update_session(&mut self, update: &SessionUpdate) -> Result<i64> {
        let session = update.session.to_string();
        self.conn.execute(
            "INSERT INTO sessions
                (value_id, session_id, last_index, last_signature, bytes_since_last_signature)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(value_id, session_id) DO UPDATE SET
                last_index = excluded.last_index,
                last_signature = excluded.last_signature,
                bytes_since_last_signature = excluded.bytes_since_last_signature",
            params![
                update.value_row,
                session,
                update.last_index,
                update.last_signature.as_bytes().as_slice(),
                update.bytes_since_last_signature as i64,
            ],
        )?;
        Ok(self.conn.query_row(
            "SELECT row_id FROM sessions WHERE value_id = ?1 AND session_id = ?2",
            params![update.value_row, session],
            |row| row.get(0),
        )?)
    }

    fn add_transaction(&mut self, session_row: i64, idx: u32, tx: &Transaction) -> Result<()> {
        self.conn.execute(
            "INSERT INTO transactions (session_row, idx, payload) VALUES (?1, ?2, ?3)",
            params![session_row, idx, encode(tx)?],
        )?;
        Ok(())
    }

    fn add_signature_checkpoint(
        &mut self,
        session_row: i64,
        idx: u32,
        signature: &Signature,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO signature_checkpoints (session_row, idx, signature)
             VALUES (?1, ?2, ?3)",
            params![session_row, idx, signature.as_bytes().as_slice()],
        )?;
        Ok(())
    }
}
