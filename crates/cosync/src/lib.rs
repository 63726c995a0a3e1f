//! # cosync
//!
//! Local-first collaborative values: create them offline, edit them
//! concurrently, and converge once peers reconnect.
//!
//! ## Overview
//!
//! A [`LocalNode`] acts for one agent. It holds:
//!
//! - **Values**: maps, lists, text, streams and binary blobs, each a set of
//!   signed per-session transaction logs merged deterministically
//! - **Groups**: values whose content decides who may read and write the
//!   values they own
//! - **Peers**: servers, clients and storage, all spoken to with the same
//!   four-message sync protocol
//!
//! ## Key Concepts
//!
//! - **Value id**: hash of the value's header. Nobody can forge it.
//! - **Session**: one writer's append-only log within a value.
//! - **Known state**: per-session transaction counts; what a peer holds.
//! - **Private transaction**: encrypted with a group key. Readers without
//!   the key see the value without it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cosync::core::{DefaultCrypto, ValueKind};
//! use cosync::{LocalNode, Owner};
//! use serde_json::json;
//!
//! async fn example() -> cosync::Result<()> {
//!     let node = LocalNode::builder()
//!         .crypto(Arc::new(DefaultCrypto))
//!         .build()?;
//!     node.add_sqlite_storage("cosync.db")?;
//!
//!     let group = node.create_group()?;
//!     let todo = node.create(ValueKind::Map, Owner::Group(group), Vec::new())?;
//!     node.map_set(todo, "title", json!("buy milk"))?;
//!
//!     let _subscription = node.subscribe(todo, |content| {
//!         println!("{}", content.to_json());
//!     })?;
//!     node.wait_for_sync(todo, Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `cosync::core` - ids, transactions, value cores and content
//! - `cosync::perms` - roles and group evaluation
//! - `cosync::store` - storage drivers
//! - `cosync::sync` - sync protocol and transports

pub mod clock;
pub mod config;
pub mod error;
mod groups;
mod host;
mod mutate;
pub mod node;
pub mod subscription;

pub use cosync_core as core;
pub use cosync_perms as perms;
pub use cosync_store as store;
pub use cosync_sync as sync;

pub use clock::{Clock, SystemClock};
pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use host::Listener;
pub use mutate::Owner;
pub use node::{
    ConnectionListener, ConnectionListenerId, LoadOptions, Loaded, LocalNode, NodeBuilder,
};
pub use subscription::Subscription;

pub use cosync_core::{AgentId, AgentSecret, Change, ValueContent, ValueId, ValueKind};
pub use cosync_perms::Role;
pub use cosync_sync::{PeerConnection, PeerId, PeerRole, ValueStatus};
