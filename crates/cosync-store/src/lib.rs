//! # cosync store
//!
//! Persistence for value logs. Drivers expose a handful of primitive
//! operations inside a transaction; load/store logic on top of them splits
//! session logs at signature checkpoints.
//!
//! ## Key Types
//!
//! - [`StorageTx`] - The eight primitive operations
//! - [`StorageDriver`] / [`AsyncStorageDriver`] - Sync and async transactions
//! - [`SqliteDriver`] - SQLite-based persistent storage
//! - [`MemoryDriver`] - In-memory storage for tests
//! - [`SyncStorage`] / [`AsyncStorage`] - Checkpointed load and store
//! - [`ValueStore`] - Object-safe front end used by the storage peer
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cosync_store::{AsyncStorage, SqliteDriver, StorageConfig, ValueStore};
//!
//! async fn example() {
//!     let driver = SqliteDriver::open("cosync.db").unwrap();
//!     let storage = AsyncStorage::new(driver, StorageConfig::default());
//!     // let loaded = storage.load(value_id).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent stores**: content already stored is skipped
//! - **Mismatch reporting**: content that assumes a prefix storage lacks is
//!   refused and the stored known state is returned for a correction
//! - **Rollback**: a failed transaction leaves storage untouched

pub mod error;
pub mod limiter;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod storage;
pub mod traits;

pub use error::{Result, StoreError};
pub use limiter::ParallelOpsLimiter;
pub use memory::MemoryDriver;
pub use sqlite::SqliteDriver;
pub use storage::{
    load_value, store_message, AsyncStorage, StorageConfig, StoreOutcome, SyncStorage, ValueStore,
};
pub use traits::{
    AsyncStorageDriver, SessionUpdate, StorageDriver, StorageTx, StoredCheckpoint, StoredSession,
    StoredTransaction, StoredValue,
};
