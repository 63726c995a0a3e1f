//! The local node: unified API for creating, loading and syncing values.
//!
//! A node owns one agent identity, every value it has loaded, and the sync
//! state for each connected peer. All of that sits behind one lock that is
//! never held across an `.await`; peer I/O runs on tokio tasks.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use cosync_core::{
    AgentId, AgentSecret, CryptoProvider, KnownState, SessionId, ValueContent, ValueId,
};
use cosync_store::{AsyncStorage, SqliteDriver, ValueStore};
use cosync_sync::{
    memory, PeerConnection, PeerId, PeerOutbox, PeerRole, PeerSink, PeerSource, StoragePeer,
    SyncError, SyncManager, SyncMessage, ValueStatus, WaiterId,
};

use crate::clock::{Clock, SystemClock};
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::host::{Listener, NodeHost};
use crate::subscription::Subscription;

/// Called when a peer connects (`true`) or goes away (`false`).
pub type ConnectionListener = Arc<dyn Fn(&PeerId, bool) + Send + Sync>;

/// Handle for removing a connection listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionListenerId(u64);

/// Options for [`LocalNode::load`].
#[derive(Clone)]
pub struct LoadOptions {
    /// How many levels of dependencies (owner groups, parent groups) to
    /// load along with the value.
    pub resolve_depth: usize,
    /// Materialize content as this agent instead of the node's own.
    pub load_as: Option<AgentSecret>,
    /// Overrides [`NodeConfig::load_timeout`].
    pub timeout: Option<Duration>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            resolve_depth: 2,
            load_as: None,
            timeout: None,
        }
    }
}

/// Result of a load.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded {
    /// Content as seen by the loading agent.
    Available(ValueContent),
    /// Neither this node nor any upstream peer has the value.
    Unavailable,
}

impl Loaded {
    pub fn content(&self) -> Option<&ValueContent> {
        match self {
            Loaded::Available(content) => Some(content),
            Loaded::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Loaded::Available(_))
    }
}

/// Builder for a [`LocalNode`].
///
/// No crypto provider is assumed: one must be given explicitly.
pub struct NodeBuilder {
    agent: Option<AgentSecret>,
    crypto: Option<Arc<dyn CryptoProvider>>,
    clock: Arc<dyn Clock>,
    config: NodeConfig,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            agent: None,
            crypto: None,
            clock: Arc::new(SystemClock),
            config: NodeConfig::default(),
        }
    }

    /// The agent this node acts as. A fresh one is generated if unset.
    pub fn agent(mut self, agent: AgentSecret) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn crypto(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the node. Must be called within a tokio runtime.
    pub fn build(self) -> Result<LocalNode> {
        let crypto = self
            .crypto
            .ok_or_else(|| NodeError::Config("no crypto provider configured".into()))?;
        let runtime = Handle::try_current()
            .map_err(|e| NodeError::Config(format!("no tokio runtime: {e}")))?;
        let agent = self.agent.unwrap_or_else(|| crypto.new_agent_secret());
        let agent_id = crypto.agent_id(&agent);

        let state = NodeState {
            host: NodeHost::new(Arc::clone(&crypto), self.config.allow_unsafe_rulesets),
            sync: SyncManager::new(self.config.sync.clone()),
            tasks: HashMap::new(),
            connection_listeners: Vec::new(),
            flush_scheduled: false,
            next_id: 0,
        };
        tracing::debug!(agent = %agent_id, "node started");

        Ok(LocalNode {
            inner: Arc::new(NodeInner {
                agent,
                agent_id,
                crypto,
                clock: self.clock,
                config: self.config,
                runtime,
                state: Mutex::new(state),
            }),
        })
    }
}

pub(crate) struct NodeState {
    pub(crate) host: NodeHost,
    pub(crate) sync: SyncManager,
    tasks: HashMap<PeerId, Vec<JoinHandle<()>>>,
    connection_listeners: Vec<(u64, ConnectionListener)>,
    flush_scheduled: bool,
    next_id: u64,
}

impl NodeState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub(crate) struct NodeInner {
    pub(crate) agent: AgentSecret,
    pub(crate) agent_id: AgentId,
    pub(crate) crypto: Arc<dyn CryptoProvider>,
    clock: Arc<dyn Clock>,
    pub(crate) config: NodeConfig,
    runtime: Handle,
    state: Mutex<NodeState>,
}

impl NodeInner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn unsubscribe(&self, id: &ValueId, key: u64) {
        let mut state = self.lock();
        if let Some(listeners) = state.host.subscribers.get_mut(id) {
            listeners.retain(|(k, _)| *k != key);
            if listeners.is_empty() {
                state.host.subscribers.remove(id);
            }
        }
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in state.tasks.values().flatten() {
            task.abort();
        }
    }
}

/// A node holding values for one agent.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LocalNode {
    pub(crate) inner: Arc<NodeInner>,
}

impl LocalNode {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    /// The agent this node acts as.
    pub fn agent_id(&self) -> AgentId {
        self.inner.agent_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, NodeState> {
        self.inner.lock()
    }

    pub(crate) fn now(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    pub(crate) fn own_session(&self, state: &mut NodeState, id: ValueId) -> SessionId {
        let agent = self.inner.agent_id;
        *state
            .host
            .sessions
            .entry(id)
            .or_insert_with(|| SessionId::new_random(agent))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────────

    /// Load a value, asking upstream peers if it is not held locally.
    ///
    /// Resolves to [`Loaded::Unavailable`] once every upstream peer reported
    /// the value missing, or right away when there are none. Errors with
    /// [`NodeError::Timeout`] if peers stay silent.
    pub async fn load(&self, id: ValueId, options: LoadOptions) -> Result<Loaded> {
        let timeout = options.timeout.unwrap_or(self.inner.config.load_timeout);
        if !self.fetch(id, timeout).await? {
            return Ok(Loaded::Unavailable);
        }

        let mut seen = HashSet::from([id]);
        let mut frontier = vec![id];
        for _ in 0..options.resolve_depth {
            let deps: Vec<ValueId> = {
                let mut state = self.state();
                let mut deps = Vec::new();
                for value in &frontier {
                    deps.extend(state.host.dependencies_of(value));
                }
                deps.retain(|dep| seen.insert(*dep));
                deps
            };
            if deps.is_empty() {
                break;
            }
            for dep in &deps {
                if !self.fetch(*dep, timeout).await? {
                    tracing::debug!(value = %id, dependency = %dep, "dependency unavailable");
                }
            }
            frontier = deps;
        }

        let reader = options.load_as.as_ref().unwrap_or(&self.inner.agent);
        let content = self.state().host.content_for(&id, reader);
        Ok(content.map_or(Loaded::Unavailable, Loaded::Available))
    }

    /// Make sure `id` is held locally. Returns whether it is.
    async fn fetch(&self, id: ValueId, timeout: Duration) -> Result<bool> {
        let rx = {
            let mut guard = self.state();
            let state = &mut *guard;
            if state.host.values.contains_key(&id) {
                return Ok(true);
            }
            if !state.sync.load(&state.host, id) {
                return Ok(false);
            }
            let (tx, rx) = oneshot::channel();
            state.host.load_waiters.entry(id).or_default().push(tx);
            rx
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(available)) => Ok(available),
            Ok(Err(_)) => Ok(false),
            Err(_) => Err(NodeError::Timeout(format!("loading {id}"))),
        }
    }

    /// Current content of a loaded value.
    pub fn content(&self, id: &ValueId) -> Result<ValueContent> {
        self.state()
            .host
            .content_for(id, &self.inner.agent)
            .ok_or(NodeError::NotLoaded(*id))
    }

    /// What this node holds of a value.
    pub fn known_state(&self, id: &ValueId) -> Result<KnownState> {
        Ok(self.state().host.require(id)?.known_state())
    }

    /// Watch a loaded value.
    ///
    /// The listener is called right away with the current content and again
    /// after every change, including changes to groups that decide who may
    /// write it. Dropping the subscription stops the calls.
    pub fn subscribe<F>(&self, id: ValueId, listener: F) -> Result<Subscription>
    where
        F: Fn(&ValueContent) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let (key, content) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let content = state
                .host
                .content_for(&id, &self.inner.agent)
                .ok_or(NodeError::NotLoaded(id))?;
            let key = state.next_id();
            state
                .host
                .subscribers
                .entry(id)
                .or_default()
                .push((key, Arc::clone(&listener)));
            (key, content)
        };
        listener(&content);
        Ok(Subscription::new(Arc::downgrade(&self.inner), id, key))
    }

    /// Call subscribers of everything changed since the last call.
    ///
    /// Listeners run outside the node lock and may call back into the node.
    pub(crate) fn dispatch(&self) {
        let batch = self.state().host.take_notifications(&self.inner.agent);
        for (listeners, content) in batch {
            for listener in listeners {
                listener(&content);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────────────────────

    /// Wait until every upstream peer has confirmed what this node holds of
    /// `id` right now.
    ///
    /// Returns immediately when there are no upstream peers. On timeout the
    /// wait is cancelled; other waits are unaffected.
    pub async fn wait_for_sync(&self, id: ValueId, timeout: Duration) -> Result<()> {
        let waits = {
            let mut guard = self.state();
            let state = &mut *guard;
            let target = state.host.require(&id)?.known_state();
            let mut waits = Vec::new();
            for peer in state.sync.upstream_peers() {
                waits.push(state.sync.wait_for(&peer, target.clone())?);
            }
            waits
        };
        let waiters: Vec<WaiterId> = waits.iter().map(|(waiter, _)| *waiter).collect();

        let all = async move {
            for (_, rx) in waits {
                rx.await.map_err(|_| SyncError::Cancelled)?;
            }
            Ok::<(), NodeError>(())
        };
        match tokio::time::timeout(timeout, all).await {
            Ok(result) => result,
            Err(_) => {
                let mut state = self.state();
                for waiter in waiters {
                    state.sync.cancel_wait(waiter);
                }
                Err(NodeError::Timeout(format!("syncing {id}")))
            }
        }
    }

    /// Sync status of a value with one peer.
    pub fn status(&self, id: &ValueId, peer: &PeerId) -> ValueStatus {
        let state = self.state();
        state.sync.status(&state.host, peer, id)
    }

    /// Send queued local changes now instead of on the deferred flush.
    pub fn flush(&self) {
        let mut guard = self.state();
        let state = &mut *guard;
        state.flush_scheduled = false;
        state.sync.flush(&state.host);
    }

    /// Arrange for one flush after the current burst of changes.
    pub(crate) fn schedule_flush(&self, state: &mut NodeState) {
        if state.flush_scheduled || !state.sync.has_pending_flush() {
            return;
        }
        state.flush_scheduled = true;
        let node = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            tokio::task::yield_now().await;
            if let Some(inner) = node.upgrade() {
                LocalNode { inner }.flush();
            }
        });
    }

    fn receive(&self, peer: &PeerId, message: SyncMessage) {
        {
            let mut guard = self.state();
            let state = &mut *guard;
            state.sync.handle(&mut state.host, peer, message);
            self.schedule_flush(state);
        }
        self.dispatch();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Connect a peer.
    ///
    /// Upstream peers (servers and storage) are asked about every value held
    /// here and receive every local change.
    pub fn add_peer(&self, peer: PeerId, role: PeerRole, connection: PeerConnection) -> Result<()> {
        let PeerConnection { sink, source } = connection;
        let listeners = {
            let mut guard = self.state();
            let state = &mut *guard;
            let outbox = state.sync.add_peer(&state.host, peer.clone(), role)?;
            let writer = self
                .inner
                .runtime
                .spawn(write_loop(peer.clone(), outbox, sink));
            let pump = self.inner.runtime.spawn(pump_loop(
                Arc::downgrade(&self.inner),
                peer.clone(),
                source,
            ));
            state.tasks.insert(peer.clone(), vec![writer, pump]);
            connection_listeners(state)
        };
        tracing::info!(%peer, ?role, "peer connected");
        for listener in listeners {
            listener(&peer, true);
        }
        Ok(())
    }

    /// Attach a store as a storage peer on its own task.
    pub fn add_storage(&self, store: Arc<dyn ValueStore>) -> Result<PeerId> {
        let peer = {
            let mut state = self.state();
            PeerId::new(format!("storage-{}", state.next_id()))
        };
        let (local, remote) = memory::pair(self.inner.config.sync.message_limits);
        let task = {
            let _runtime = self.inner.runtime.enter();
            StoragePeer::new(store).spawn(remote)
        };
        if let Err(e) = self.add_peer(peer.clone(), PeerRole::Storage, local) {
            task.abort();
            return Err(e);
        }
        if let Some(tasks) = self.state().tasks.get_mut(&peer) {
            tasks.push(task);
        }
        Ok(peer)
    }

    /// Open (or create) a SQLite database and attach it as storage.
    pub fn add_sqlite_storage(&self, path: impl AsRef<Path>) -> Result<PeerId> {
        let driver = SqliteDriver::open(path)?;
        let store = AsyncStorage::new(driver, self.inner.config.storage.clone());
        self.add_storage(Arc::new(store))
    }

    /// Disconnect a peer. Values stay loaded.
    pub fn disconnect_peer(&self, peer: &PeerId) -> bool {
        self.drop_peer(peer, true)
    }

    fn drop_peer(&self, peer: &PeerId, abort_tasks: bool) -> bool {
        let (removed, tasks, listeners) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let removed = state.sync.remove_peer(&mut state.host, peer);
            let tasks = state.tasks.remove(peer).unwrap_or_default();
            (removed, tasks, connection_listeners(state))
        };
        if abort_tasks {
            for task in tasks {
                task.abort();
            }
        }
        if removed {
            tracing::info!(%peer, "peer disconnected");
            for listener in listeners {
                listener(peer, false);
            }
        }
        removed
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.state().sync.peers()
    }

    /// Register a callback for peers connecting and disconnecting.
    pub fn on_connection_change<F>(&self, listener: F) -> ConnectionListenerId
    where
        F: Fn(&PeerId, bool) + Send + Sync + 'static,
    {
        let mut state = self.state();
        let id = state.next_id();
        state.connection_listeners.push((id, Arc::new(listener)));
        ConnectionListenerId(id)
    }

    pub fn remove_connection_listener(&self, id: ConnectionListenerId) {
        self.state()
            .connection_listeners
            .retain(|(key, _)| *key != id.0);
    }
}

fn connection_listeners(state: &NodeState) -> Vec<ConnectionListener> {
    state
        .connection_listeners
        .iter()
        .map(|(_, listener)| Arc::clone(listener))
        .collect()
}

async fn write_loop(peer: PeerId, outbox: Arc<PeerOutbox>, sink: Box<dyn PeerSink>) {
    while let Some(message) = outbox.next().await {
        if let Err(e) = sink.send(message).await {
            tracing::debug!(%peer, error = %e, "send failed");
            break;
        }
    }
    sink.close().await;
}

async fn pump_loop(node: Weak<NodeInner>, peer: PeerId, mut source: Box<dyn PeerSource>) {
    loop {
        match source.recv().await {
            Ok(Some(message)) => {
                let Some(inner) = node.upgrade() else {
                    return;
                };
                LocalNode { inner }.receive(&peer, message);
            }
            Ok(None) => break,
            Err(SyncError::InvalidMessage(reason)) => {
                tracing::warn!(%peer, %reason, "dropping invalid message");
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "connection failed");
                break;
            }
        }
    }
    if let Some(inner) = node.upgrade() {
        LocalNode { inner }.drop_peer(&peer, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosync_core::DefaultCrypto;

    #[test]
    fn test_build_needs_crypto() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        assert!(matches!(
            LocalNode::builder().build(),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn test_build_needs_runtime() {
        let result = LocalNode::builder().crypto(Arc::new(DefaultCrypto)).build();
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[tokio::test]
    async fn test_agent_from_secret() {
        let secret = AgentSecret::from_seed(&[1; 32]);
        let node = LocalNode::builder()
            .crypto(Arc::new(DefaultCrypto))
            .agent(secret.clone())
            .build()
            .unwrap();
        assert_eq!(node.agent_id(), DefaultCrypto.agent_id(&secret));
    }

    #[tokio::test]
    async fn test_load_without_peers_is_unavailable() {
        let node = LocalNode::builder()
            .crypto(Arc::new(DefaultCrypto))
            .build()
            .unwrap();
        let loaded = node
            .load(ValueId::from_bytes([7; 32]), LoadOptions::default())
            .await
            .unwrap();
        assert_eq!(loaded, Loaded::Unavailable);
    }

    #[tokio::test]
    async fn test_connection_listeners() {
        let node = LocalNode::builder()
            .crypto(Arc::new(DefaultCrypto))
            .build()
            .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let id = {
            let events = Arc::clone(&events);
            node.on_connection_change(move |peer, up| {
                events.lock().unwrap().push((peer.clone(), up));
            })
        };

        let (local, _remote) = memory::pair(node.config().sync.message_limits);
        let peer = PeerId::new("server");
        node.add_peer(peer.clone(), PeerRole::Server, local).unwrap();
        assert!(node.disconnect_peer(&peer));
        assert!(!node.disconnect_peer(&peer));
        node.remove_connection_listener(id);

        assert_eq!(
            *events.lock().unwrap(),
            vec![(peer.clone(), true), (peer, false)]
        );
    }
}
