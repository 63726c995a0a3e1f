//! # cosync testkit
//!
//! Testing utilities for cosync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: deterministic agents, a manual clock, nodes wired
//!   together over in-memory connections
//! - **Generators**: proptest strategies for edit scripts and replicas of
//!   one value
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cosync_testkit::fixtures::{connect, node, ManualClock};
//!
//! # async fn example() {
//! let clock = ManualClock::new(1_000);
//! let alice = node(1, Arc::clone(&clock));
//! let server = node(9, clock);
//! connect(&alice, &server);
//! # }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use cosync_testkit::generators::{map_scripts, replicas};
//!
//! proptest! {
//!     #[test]
//!     fn replicas_agree(scripts in map_scripts(3, 5)) {
//!         let cores = replicas(&scripts);
//!         // deliver in any order, compare content
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    agent, agent_id, connect, eventually, init_tracing, memory_store, node, node_with_config,
    within, ManualClock,
};
pub use generators::{full_content, map_change, map_scripts, replicas, writer_script};
