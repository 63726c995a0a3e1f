//! Database schema migrations for SQLite.
//!
//! Migrations are forward-only. The applied version lives in
//! `PRAGMA user_version`; each migration moves the schema from version N to
//! N+1 inside one transaction.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Read the schema version recorded in the database.
pub fn schema_version(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let current = schema_version(conn)?;
    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {current} is newer than supported version {CURRENT_VERSION}"
        )));
    }

    for version in (current + 1)..=CURRENT_VERSION {
        let tx = conn.transaction()?;
        apply_migration(&tx, version)?;
        // PRAGMA does not accept bound parameters
        tx.execute_batch(&format!("PRAGMA user_version = {version}"))?;
        tx.commit()?;
        tracing::debug!(version, "applied storage migration");
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per value: id plus CBOR-encoded header
        CREATE TABLE "values" (
            row_id INTEGER PRIMARY KEY,
            id BLOB NOT NULL UNIQUE,          -- 32 bytes, value id
            header BLOB NOT NULL
        );

        -- One row per (value, session)
        CREATE TABLE sessions (
            row_id INTEGER PRIMARY KEY,
            value_id INTEGER NOT NULL REFERENCES "values"(row_id),
            session_id TEXT NOT NULL,
            last_index INTEGER NOT NULL,      -- number of stored transactions
            last_signature BLOB NOT NULL,     -- 64 bytes
            bytes_since_last_signature INTEGER NOT NULL DEFAULT 0,

            UNIQUE(value_id, session_id)
        );

        CREATE TABLE transactions (
            session_row INTEGER NOT NULL REFERENCES sessions(row_id),
            idx INTEGER NOT NULL,
            payload BLOB NOT NULL,            -- CBOR-encoded transaction

            PRIMARY KEY (session_row, idx)
        );

        CREATE TABLE signature_checkpoints (
            session_row INTEGER NOT NULL REFERENCES sessions(row_id),
            idx INTEGER NOT NULL,
            signature BLOB NOT NULL,

            PRIMARY KEY (session_row, idx)
        );

        CREATE INDEX idx_sessions_value ON sessions(value_id);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in ["values", "sessions", "transactions", "signature_checkpoints"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        assert_eq!(schema_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_newer_schema_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA user_version = 99").unwrap();
        assert!(matches!(migrate(&mut conn), Err(StoreError::Migration(_))));
    }
}
