//! Protocol state machine.
//!
//! [`SyncManager`] decides what to send to whom. It owns the known-state
//! tracker, the dirty-value queue and every peer's outbox, but never the
//! values themselves: those are reached through a [`ValueHost`], which is
//! also where incoming content lands. Nothing in here awaits, so the node
//! can drive it under a plain mutex and leave I/O to per-peer tasks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::oneshot;

use cosync_core::{ContentMessage, IngestReport, KnownState, ValueCore, ValueId};

use crate::error::{Result, SyncError};
use crate::messages::{split_content, MessageLimits, PeerId, SyncMessage};
use crate::queue::{PeerOutbox, Priority, SyncQueue};
use crate::tracker::{KnownStateTracker, KnownUpdate, WaiterId};

/// Sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Max session pieces packed into one outgoing content message.
    pub max_content_pieces_per_message: usize,
    /// Limits enforced on incoming messages.
    pub message_limits: MessageLimits,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_content_pieces_per_message: 64,
            message_limits: MessageLimits::default(),
        }
    }
}

/// How a peer relates to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// A sync server. Loads are forwarded to it.
    Server,
    /// A peer that loads from us.
    Client,
    /// Local persistence speaking the sync protocol.
    Storage,
}

impl PeerRole {
    /// Upstream peers receive every local change and answer loads.
    pub const fn is_upstream(self) -> bool {
        !matches!(self, PeerRole::Client)
    }
}

/// Sync status of one value with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueStatus {
    /// Nothing exchanged yet.
    Unknown,
    /// We asked the peer for the value and have no answer.
    Loading,
    /// The peer lacks some of what we hold.
    KnownSubset,
    /// The peer has confirmed everything we hold.
    InSync,
}

/// What happened to incoming content.
#[derive(Debug)]
pub enum IngestOutcome {
    /// The value is unknown here and the message has no header.
    MissingHeader,
    /// The message was structurally invalid.
    Rejected(String),
    /// Per-session results.
    Applied(IngestReport),
}

/// Where values live, as seen by the sync manager.
pub trait ValueHost {
    fn value(&self, id: &ValueId) -> Option<&ValueCore>;

    /// Ids of every value held in memory.
    fn value_ids(&self) -> Vec<ValueId>;

    /// Apply incoming content, creating the value from its header if needed.
    fn ingest(&mut self, from: &PeerId, content: &ContentMessage) -> IngestOutcome;

    /// Every upstream peer reported a locally requested value as missing.
    fn unavailable(&mut self, id: &ValueId);
}

struct PeerState {
    role: PeerRole,
    outbox: Arc<PeerOutbox>,
}

#[derive(Debug, Default)]
struct PendingLoad {
    /// Upstream peers we sent a load to.
    asked: HashSet<PeerId>,
    /// Upstream peers that answered without the value.
    missing_at: HashSet<PeerId>,
    /// Clients whose own load waits on this one.
    waiting: HashSet<PeerId>,
    /// The local node asked for the value.
    local: bool,
}

/// Per-node sync state machine.
pub struct SyncManager {
    config: SyncConfig,
    peers: BTreeMap<PeerId, PeerState>,
    tracker: KnownStateTracker,
    queue: SyncQueue,
    pending: HashMap<ValueId, PendingLoad>,
}

impl SyncManager {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            peers: BTreeMap::new(),
            tracker: KnownStateTracker::new(),
            queue: SyncQueue::new(),
            pending: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn tracker(&self) -> &KnownStateTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut KnownStateTracker {
        &mut self.tracker
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a peer and return the outbox its writer task drains.
    ///
    /// Upstream peers are immediately asked about every value held in
    /// memory, which is how offline edits reach them after a reconnect.
    pub fn add_peer(
        &mut self,
        host: &dyn ValueHost,
        peer: PeerId,
        role: PeerRole,
    ) -> Result<Arc<PeerOutbox>> {
        if self.peers.contains_key(&peer) {
            return Err(SyncError::DuplicatePeer(peer));
        }
        let outbox = Arc::new(PeerOutbox::new());
        self.peers.insert(
            peer.clone(),
            PeerState {
                role,
                outbox: Arc::clone(&outbox),
            },
        );
        tracing::debug!(%peer, ?role, "peer added");

        if role.is_upstream() {
            for id in host.value_ids() {
                if let Some(core) = host.value(&id) {
                    let priority = Priority::for_kind(core.kind());
                    outbox.push(SyncMessage::Load(core.known_state()), priority);
                }
            }
        }
        Ok(outbox)
    }

    /// Forget a peer. Value data is untouched; loads waiting only on this
    /// peer resolve as unavailable.
    pub fn remove_peer(&mut self, host: &mut dyn ValueHost, peer: &PeerId) -> bool {
        let Some(state) = self.peers.remove(peer) else {
            return false;
        };
        state.outbox.close();
        self.tracker.remove_peer(peer);

        let affected: Vec<ValueId> = self
            .pending
            .iter_mut()
            .filter_map(|(id, pending)| {
                pending.waiting.remove(peer);
                pending.missing_at.remove(peer);
                pending.asked.remove(peer).then_some(*id)
            })
            .collect();
        for id in affected {
            self.settle_pending(host, id);
        }
        tracing::debug!(%peer, "peer removed");
        true
    }

    pub fn peer_role(&self, peer: &PeerId) -> Option<PeerRole> {
        self.peers.get(peer).map(|p| p.role)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn upstream_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.role.is_upstream())
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn send(&self, peer: &PeerId, message: SyncMessage, priority: Priority) {
        if let Some(state) = self.peers.get(peer) {
            tracing::trace!(%peer, action = message.action(), value = %message.value_id(), "queued");
            state.outbox.push(message, priority);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask upstream peers for a value we do not hold.
    ///
    /// Returns false when there is nobody to ask.
    pub fn load(&mut self, host: &dyn ValueHost, id: ValueId) -> bool {
        if host.value(&id).is_some() {
            return true;
        }
        let upstream = self.upstream_peers();
        if upstream.is_empty() {
            return false;
        }
        let pending = self.pending.entry(id).or_default();
        pending.local = true;
        let to_ask: Vec<PeerId> = upstream
            .into_iter()
            .filter(|peer| pending.asked.insert(peer.clone()))
            .collect();
        for peer in to_ask {
            self.send(&peer, SyncMessage::Load(KnownState::empty(id)), Priority::Medium);
        }
        true
    }

    pub fn is_loading(&self, id: &ValueId) -> bool {
        self.pending.contains_key(id)
    }

    /// Note local changes to `id`. They go out on the next [`flush`](Self::flush).
    pub fn mark_dirty(&mut self, host: &dyn ValueHost, id: ValueId) -> bool {
        let priority = priority_of(host, &id);
        self.queue.push(id, priority)
    }

    pub fn has_pending_flush(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Push every dirty value to every interested peer.
    pub fn flush(&mut self, host: &dyn ValueHost) {
        for id in self.queue.drain() {
            let interested: Vec<PeerId> = self
                .peers
                .iter()
                .filter(|(peer, state)| state.role.is_upstream() || self.tracker.has(peer, &id))
                .map(|(peer, _)| peer.clone())
                .collect();
            for peer in interested {
                self.send_content(host, &peer, id, &mut HashSet::new());
            }
        }
    }

    /// Send `peer` whatever it lacks of `id`, dependencies first.
    fn send_content(
        &mut self,
        host: &dyn ValueHost,
        peer: &PeerId,
        id: ValueId,
        visited: &mut HashSet<ValueId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        let Some(core) = host.value(&id) else {
            return;
        };
        for dependency in core.header().dependencies() {
            if host.value(&dependency).is_some() {
                self.send_content(host, peer, dependency, visited);
            }
        }

        let local = core.known_state();
        let since = self.tracker.optimistic(peer, &id).cloned();
        if since.as_ref().is_some_and(|s| local.is_subset_of(s)) {
            return;
        }

        let priority = Priority::for_kind(core.kind());
        let max_pieces = self.config.max_content_pieces_per_message;
        for message in core.new_content_since(since.as_ref()) {
            for part in split_content(message, max_pieces) {
                self.tracker
                    .apply(peer, KnownUpdate::Optimistic(part.resulting_known()));
                self.send(peer, SyncMessage::Content(part), priority);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incoming messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle one message from `from`.
    pub fn handle(&mut self, host: &mut dyn ValueHost, from: &PeerId, message: SyncMessage) {
        if !self.peers.contains_key(from) {
            tracing::warn!(peer = %from, action = message.action(), "message from unknown peer dropped");
            return;
        }
        tracing::debug!(peer = %from, action = message.action(), value = %message.value_id(), "received");

        match message {
            SyncMessage::Load(known) => self.handle_load(host, from, known),
            SyncMessage::Known {
                known,
                is_correction,
            } => self.handle_known(host, from, known, is_correction),
            SyncMessage::Content(content) => self.handle_content(host, from, content),
            SyncMessage::Done { id } => self.tracker.remove(from, &id),
        }
    }

    fn handle_load(&mut self, host: &mut dyn ValueHost, from: &PeerId, known: KnownState) {
        let id = known.id;
        self.tracker.apply(from, KnownUpdate::Replace(known));

        if let Some(core) = host.value(&id) {
            let priority = Priority::for_kind(core.kind());
            self.send(from, SyncMessage::known(core.known_state()), priority);
            self.send_content(&*host, from, id, &mut HashSet::new());
            return;
        }

        let others: Vec<PeerId> = self
            .upstream_peers()
            .into_iter()
            .filter(|peer| peer != from)
            .collect();
        if others.is_empty() {
            self.send(from, SyncMessage::known(KnownState::empty(id)), Priority::Medium);
            return;
        }

        let pending = self.pending.entry(id).or_default();
        pending.waiting.insert(from.clone());
        let to_ask: Vec<PeerId> = others
            .into_iter()
            .filter(|peer| pending.asked.insert(peer.clone()))
            .collect();
        for peer in to_ask {
            self.send(&peer, SyncMessage::Load(KnownState::empty(id)), Priority::Medium);
        }
    }

    fn handle_known(
        &mut self,
        host: &mut dyn ValueHost,
        from: &PeerId,
        known: KnownState,
        is_correction: bool,
    ) {
        let id = known.id;
        let has_header = known.header;
        if is_correction {
            tracing::warn!(peer = %from, value = %id, "correction received");
            self.tracker.apply(from, KnownUpdate::Replace(known));
        } else {
            self.tracker.apply(from, KnownUpdate::Combine(known));
        }

        if host.value(&id).is_some() {
            self.send_content(&*host, from, id, &mut HashSet::new());
            return;
        }

        if !has_header {
            if let Some(pending) = self.pending.get_mut(&id) {
                if pending.asked.contains(from) {
                    pending.missing_at.insert(from.clone());
                    self.settle_pending(host, id);
                }
            }
        }
    }

    fn handle_content(&mut self, host: &mut dyn ValueHost, from: &PeerId, content: ContentMessage) {
        let id = content.id;
        let existed = host.value(&id).is_some();
        let report = match host.ingest(from, &content) {
            IngestOutcome::Applied(report) => report,
            IngestOutcome::MissingHeader => {
                tracing::warn!(peer = %from, value = %id, "content without header for unknown value");
                self.send(from, SyncMessage::correction(KnownState::empty(id)), Priority::Medium);
                return;
            }
            IngestOutcome::Rejected(reason) => {
                tracing::warn!(peer = %from, value = %id, %reason, "content rejected");
                return;
            }
        };

        self.tracker
            .apply(from, KnownUpdate::Combine(content.resulting_known()));

        let Some(core) = host.value(&id) else {
            return;
        };
        let priority = Priority::for_kind(core.kind());
        let local = core.known_state();
        let dependencies = core.header().dependencies();

        if report.needs_correction() {
            tracing::warn!(peer = %from, value = %id, gaps = report.gaps.len(), "content past our prefix");
            self.send(from, SyncMessage::correction(local), priority);
        } else {
            self.send(from, SyncMessage::known(local), priority);
        }

        if report.added > 0 {
            self.queue.push(id, priority);
        }

        if !existed {
            for dependency in dependencies {
                if host.value(&dependency).is_none() && !self.is_loading(&dependency) {
                    self.load(&*host, dependency);
                }
            }
        }

        if let Some(pending) = self.pending.remove(&id) {
            for client in pending.waiting {
                if let Some(core) = host.value(&id) {
                    self.send(&client, SyncMessage::known(core.known_state()), priority);
                }
                self.send_content(&*host, &client, id, &mut HashSet::new());
            }
        }
    }

    /// Resolve a pending load once every asked peer reported the value
    /// missing.
    fn settle_pending(&mut self, host: &mut dyn ValueHost, id: ValueId) {
        let Some(pending) = self.pending.get(&id) else {
            return;
        };
        if !pending.asked.iter().all(|peer| pending.missing_at.contains(peer)) {
            return;
        }
        let Some(pending) = self.pending.remove(&id) else {
            return;
        };
        tracing::debug!(value = %id, "value unavailable upstream");
        for client in &pending.waiting {
            self.send(client, SyncMessage::known(KnownState::empty(id)), Priority::Medium);
        }
        if pending.local {
            host.unavailable(&id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    pub fn status(&self, host: &dyn ValueHost, peer: &PeerId, id: &ValueId) -> ValueStatus {
        if self
            .pending
            .get(id)
            .is_some_and(|p| p.asked.contains(peer) && !p.missing_at.contains(peer))
        {
            return ValueStatus::Loading;
        }
        let Some(confirmed) = self.tracker.confirmed(peer, id) else {
            return ValueStatus::Unknown;
        };
        match host.value(id) {
            Some(core) if core.known_state().is_subset_of(confirmed) => ValueStatus::InSync,
            Some(_) => ValueStatus::KnownSubset,
            None => ValueStatus::Unknown,
        }
    }

    /// Resolve once `peer` has confirmed `target`.
    pub fn wait_for(
        &mut self,
        peer: &PeerId,
        target: KnownState,
    ) -> Result<(WaiterId, oneshot::Receiver<()>)> {
        if !self.peers.contains_key(peer) {
            return Err(SyncError::PeerNotConnected(peer.clone()));
        }
        Ok(self.tracker.wait_for(peer, target))
    }

    pub fn cancel_wait(&mut self, waiter: WaiterId) {
        self.tracker.cancel(waiter);
    }
}

fn priority_of(host: &dyn ValueHost, id: &ValueId) -> Priority {
    host.value(id)
        .map(|core| Priority::for_kind(core.kind()))
        .unwrap_or(Priority::Medium)
}
