//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: deterministic agents, a clock
//! tests can move by hand, and nodes wired together in memory.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use cosync::sync::memory;
use cosync::{Clock, LocalNode, NodeConfig, PeerId, PeerRole};
use cosync_core::{AgentId, AgentSecret, CryptoProvider, DefaultCrypto};
use cosync_store::{MemoryDriver, StorageConfig, SyncStorage, ValueStore};

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start),
        })
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Route `tracing` output to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// An agent derived from a one-byte seed.
pub fn agent(seed: u8) -> AgentSecret {
    AgentSecret::from_seed(&[seed; 32])
}

pub fn agent_id(seed: u8) -> AgentId {
    DefaultCrypto.agent_id(&agent(seed))
}

/// A node for the agent with `seed`, reading time from `clock`.
///
/// Unsafe rulesets are allowed so tests can use open values.
pub fn node(seed: u8, clock: Arc<ManualClock>) -> LocalNode {
    node_with_config(
        seed,
        clock,
        NodeConfig {
            allow_unsafe_rulesets: true,
            load_timeout: Duration::from_secs(5),
            ..NodeConfig::default()
        },
    )
}

pub fn node_with_config(seed: u8, clock: Arc<ManualClock>, config: NodeConfig) -> LocalNode {
    LocalNode::builder()
        .agent(agent(seed))
        .crypto(Arc::new(DefaultCrypto))
        .clock(clock)
        .config(config)
        .build()
        .expect("node builds inside a tokio runtime")
}

/// In-memory storage, shareable between nodes to simulate a reopened store.
pub fn memory_store() -> Arc<dyn ValueStore> {
    Arc::new(SyncStorage::new(MemoryDriver::new(), StorageConfig::default()))
}

/// Connect `client` to `server` in memory.
///
/// Returns the peer id each side uses for the other: `(on_client, on_server)`.
pub fn connect(client: &LocalNode, server: &LocalNode) -> (PeerId, PeerId) {
    let (client_end, server_end) = memory::pair(client.config().sync.message_limits);
    let on_client = PeerId::new(format!("server-{}", server.agent_id()));
    let on_server = PeerId::new(format!("client-{}", client.agent_id()));
    client
        .add_peer(on_client.clone(), PeerRole::Server, client_end)
        .expect("fresh peer id");
    server
        .add_peer(on_server.clone(), PeerRole::Client, server_end)
        .expect("fresh peer id");
    (on_client, on_server)
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future`, failing the test if it takes more than a few seconds.
pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .unwrap_or_else(|_| panic!("timed out: {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_millis(), 100);
        clock.advance(5);
        assert_eq!(clock.now_millis(), 105);
        clock.set(1);
        assert_eq!(clock.now_millis(), 1);
    }

    #[test]
    fn test_agents_are_deterministic() {
        assert_eq!(agent_id(1), agent_id(1));
        assert_ne!(agent_id(1), agent_id(2));
    }

    #[tokio::test]
    async fn test_connect_registers_both_sides() {
        let clock = ManualClock::new(0);
        let client = node(1, Arc::clone(&clock));
        let server = node(2, clock);
        let (on_client, on_server) = connect(&client, &server);
        assert_eq!(client.peers(), vec![on_client]);
        assert_eq!(server.peers(), vec![on_server]);
    }
}
