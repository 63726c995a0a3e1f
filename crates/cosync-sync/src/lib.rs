//! # cosync sync
//!
//! Sync protocol for replicating values between nodes.
//!
//! ## Overview
//!
//! Peers exchange per-value known states and send each other exactly the
//! session suffixes the other side lacks. Network servers, clients and local
//! storage all speak the same four messages.
//!
//! ## Key Properties
//!
//! - **Idempotent**: re-sent content is skipped by the receiver
//! - **Self-correcting**: a wrong belief about a peer is fixed by a
//!   correction, never by a full reset
//! - **Prioritized**: permission data goes out before content, binary data last
//! - **Dependencies first**: a value's owning group is synced before it
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cosync_sync::{PeerId, PeerRole, SyncConfig, SyncManager};
//!
//! fn example() {
//!     let mut manager = SyncManager::new(SyncConfig::default());
//!     // let outbox = manager.add_peer(&host, PeerId::new("server"), PeerRole::Server)?;
//!     // manager.load(&host, value_id);
//!     // while let Some(message) = outbox.try_pop() { /* send it */ }
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- Load(known A) --------->|
//!   |<------- Known(known B) ---------|
//!   |<------- Content(B - A) ---------|
//!   |-------- Known(ack) ------------>|
//!   |-------- Content(A - B) -------->|
//!   |<------- Known(ack) -------------|
//! ```

pub mod error;
pub mod manager;
pub mod messages;
pub mod queue;
pub mod storage_peer;
pub mod tracker;
pub mod transport;

pub use error::{Result, SyncError};
pub use manager::{
    IngestOutcome, PeerRole, SyncConfig, SyncManager, ValueHost, ValueStatus,
};
pub use messages::{limits, split_content, MessageLimits, PeerId, SyncMessage};
pub use queue::{PeerOutbox, Priority, SyncQueue};
pub use storage_peer::StoragePeer;
pub use tracker::{ChangeListener, KnownStateTracker, KnownUpdate, ListenerId, WaiterId};
pub use transport::{memory, PeerConnection, PeerSink, PeerSource};
