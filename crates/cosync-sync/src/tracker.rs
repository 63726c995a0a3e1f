//! What each peer is known to hold, per value.
//!
//! Every (peer, value) pair has a confirmed state, built from what the peer
//! told us, and an optional optimistic overlay covering content we sent but
//! the peer has not acknowledged yet. All mutation goes through
//! [`KnownStateTracker::apply`].

use std::collections::HashMap;

use tokio::sync::oneshot;

use cosync_core::{KnownState, ValueId};

use crate::messages::PeerId;

/// A change to a peer's known state.
#[derive(Debug, Clone)]
pub enum KnownUpdate {
    /// Merge in what the peer reported. Never lowers the confirmed state.
    Combine(KnownState),
    /// Overwrite the confirmed state (after a correction).
    Replace(KnownState),
    /// The peer holds nothing of this value.
    Empty(ValueId),
    /// Content sent but not acknowledged yet.
    Optimistic(KnownState),
}

/// Handle for a registered change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Handle for a pending [`KnownStateTracker::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

/// Called with the peer and its new confirmed state.
pub type ChangeListener = Box<dyn FnMut(&PeerId, &KnownState) + Send>;

#[derive(Debug, Clone)]
struct PeerKnown {
    confirmed: KnownState,
    optimistic: Option<KnownState>,
}

struct Waiter {
    id: WaiterId,
    target: KnownState,
    done: oneshot::Sender<()>,
}

/// Known state per (peer, value).
#[derive(Default)]
pub struct KnownStateTracker {
    entries: HashMap<(PeerId, ValueId), PeerKnown>,
    listeners: Vec<(ListenerId, ChangeListener)>,
    waiters: HashMap<(PeerId, ValueId), Vec<Waiter>>,
    next_id: u64,
}

impl KnownStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one update. Returns true if the confirmed state changed.
    pub fn apply(&mut self, peer: &PeerId, update: KnownUpdate) -> bool {
        let id = match &update {
            KnownUpdate::Combine(k) | KnownUpdate::Replace(k) | KnownUpdate::Optimistic(k) => k.id,
            KnownUpdate::Empty(id) => *id,
        };
        let entry = self
            .entries
            .entry((peer.clone(), id))
            .or_insert_with(|| PeerKnown {
                confirmed: KnownState::empty(id),
                optimistic: None,
            });

        let changed = match update {
            KnownUpdate::Combine(known) => {
                let before = entry.confirmed.clone();
                entry.confirmed.combine_with(&known);
                if entry
                    .optimistic
                    .as_ref()
                    .is_some_and(|o| o.is_subset_of(&entry.confirmed))
                {
                    entry.optimistic = None;
                }
                entry.confirmed != before
            }
            KnownUpdate::Replace(known) => {
                let changed = entry.confirmed != known;
                entry.confirmed = known;
                entry.optimistic = None;
                changed
            }
            KnownUpdate::Empty(id) => {
                let empty = KnownState::empty(id);
                let changed = entry.confirmed != empty;
                entry.confirmed = empty;
                entry.optimistic = None;
                changed
            }
            KnownUpdate::Optimistic(known) => {
                let merged = entry
                    .optimistic
                    .as_ref()
                    .unwrap_or(&entry.confirmed)
                    .combined(&known);
                entry.optimistic = (!merged.is_subset_of(&entry.confirmed)).then_some(merged);
                false
            }
        };

        if changed {
            let confirmed = entry.confirmed.clone();
            for (_, listener) in &mut self.listeners {
                listener(peer, &confirmed);
            }
            self.resolve_waiters(peer, &confirmed);
        }
        changed
    }

    fn resolve_waiters(&mut self, peer: &PeerId, confirmed: &KnownState) {
        let key = (peer.clone(), confirmed.id);
        let Some(waiters) = self.waiters.get_mut(&key) else {
            return;
        };
        let mut pending = Vec::with_capacity(waiters.len());
        for waiter in waiters.drain(..) {
            if waiter.target.is_subset_of(confirmed) {
                let _ = waiter.done.send(());
            } else if !waiter.done.is_closed() {
                pending.push(waiter);
            }
        }
        if pending.is_empty() {
            self.waiters.remove(&key);
        } else {
            *waiters = pending;
        }
    }

    /// What the peer has confirmed holding.
    pub fn confirmed(&self, peer: &PeerId, id: &ValueId) -> Option<&KnownState> {
        self.entries.get(&(peer.clone(), *id)).map(|e| &e.confirmed)
    }

    /// What the peer will hold once everything in flight arrives.
    pub fn optimistic(&self, peer: &PeerId, id: &ValueId) -> Option<&KnownState> {
        self.entries
            .get(&(peer.clone(), *id))
            .map(|e| e.optimistic.as_ref().unwrap_or(&e.confirmed))
    }

    pub fn has(&self, peer: &PeerId, id: &ValueId) -> bool {
        self.entries.contains_key(&(peer.clone(), *id))
    }

    /// Peers with any tracked state for `id`.
    pub fn peers_for(&self, id: &ValueId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .entries
            .keys()
            .filter(|(_, value)| value == id)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// True when the peer has confirmed everything in `local`.
    pub fn is_synced(&self, peer: &PeerId, local: &KnownState) -> bool {
        self.confirmed(peer, &local.id)
            .is_some_and(|confirmed| local.is_subset_of(confirmed))
    }

    /// Resolve once the peer has confirmed `target`.
    ///
    /// The receiver errors if the waiter is cancelled or the peer is removed.
    pub fn wait_for(&mut self, peer: &PeerId, target: KnownState) -> (WaiterId, oneshot::Receiver<()>) {
        let id = WaiterId(self.next_id());
        let (done, rx) = oneshot::channel();
        if self.is_synced(peer, &target) {
            let _ = done.send(());
        } else {
            self.waiters
                .entry((peer.clone(), target.id))
                .or_default()
                .push(Waiter { id, target, done });
        }
        (id, rx)
    }

    /// Drop one waiter without touching others on the same value.
    pub fn cancel(&mut self, waiter: WaiterId) {
        self.waiters.retain(|_, waiters| {
            waiters.retain(|w| w.id != waiter);
            !waiters.is_empty()
        });
    }

    pub fn on_change(&mut self, listener: ChangeListener) -> ListenerId {
        let id = ListenerId(self.next_id());
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.retain(|(l, _)| *l != id);
    }

    /// Forget one value for one peer.
    pub fn remove(&mut self, peer: &PeerId, id: &ValueId) {
        let key = (peer.clone(), *id);
        self.entries.remove(&key);
        self.waiters.remove(&key);
    }

    /// Forget everything about a peer. Its waiters are cancelled.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.entries.retain(|(p, _), _| p != peer);
        self.waiters.retain(|(p, _), _| p != peer);
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}
