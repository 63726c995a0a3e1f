//! Node configuration.

use std::time::Duration;

use cosync_store::StorageConfig;
use cosync_sync::SyncConfig;

/// Configuration for a [`LocalNode`](crate::LocalNode).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Accept values whose ruleset lets anyone write.
    ///
    /// Off by default; creating or ingesting such a value is refused.
    pub allow_unsafe_rulesets: bool,
    /// How long `load` waits for upstream peers before giving up.
    pub load_timeout: Duration,
    /// Largest binary chunk written in one transaction.
    pub binary_chunk_size: usize,
    /// Sync configuration.
    pub sync: SyncConfig,
    /// Storage configuration for stores the node opens itself.
    pub storage: StorageConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            allow_unsafe_rulesets: false,
            load_timeout: Duration::from_secs(30),
            binary_chunk_size: 64 * 1024,
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}
