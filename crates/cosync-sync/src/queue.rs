//! Outgoing work, batched and prioritized.
//!
//! [`SyncQueue`] collects ids of values with unsent local changes so a burst
//! of edits turns into one flush. [`PeerOutbox`] holds the messages a peer's
//! writer task still has to send.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use cosync_core::{ValueId, ValueKind};

use crate::messages::SyncMessage;

/// Sending priority. Lower lanes wait for higher ones to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// Permission data first, bulk binary data last.
    pub const fn for_kind(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Group | ValueKind::Account => Priority::High,
            ValueKind::BinaryStream => Priority::Low,
            _ => Priority::Medium,
        }
    }

    const fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// Deduplicated set of values waiting to be flushed.
#[derive(Debug, Default)]
pub struct SyncQueue {
    lanes: [VecDeque<ValueId>; 3],
    queued: HashSet<ValueId>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a value. Returns false if it was already waiting.
    pub fn push(&mut self, id: ValueId, priority: Priority) -> bool {
        if !self.queued.insert(id) {
            return false;
        }
        self.lanes[priority.lane()].push_back(id);
        true
    }

    /// Take everything, highest lane first.
    pub fn drain(&mut self) -> Vec<ValueId> {
        self.queued.clear();
        self.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }
}

/// Per-peer outgoing messages in three lanes.
///
/// Each lane is first in, first out. Once a value is held locally its
/// messages all go in the lane of its kind, so its content pieces leave in
/// order. Messages about a value not yet held (loads, empty known states,
/// corrections) use the medium lane; they always precede any content for
/// that value.
#[derive(Debug, Default)]
pub struct PeerOutbox {
    lanes: Mutex<[VecDeque<SyncMessage>; 3]>,
    notify: Notify,
    closed: AtomicBool,
}

impl PeerOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: SyncMessage, priority: Priority) {
        if self.is_closed() {
            return;
        }
        match self.lanes.lock() {
            Ok(mut lanes) => lanes[priority.lane()].push_back(message),
            Err(_) => {
                tracing::warn!(
                    action = message.action(),
                    value = %message.value_id(),
                    "outbox lock poisoned, message dropped"
                );
                return;
            }
        }
        self.notify.notify_one();
    }

    /// The next message, checking higher lanes first every time.
    pub fn try_pop(&self) -> Option<SyncMessage> {
        let mut lanes = self.lanes.lock().ok()?;
        lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Wait for the next message. Returns `None` once closed.
    pub async fn next(&self) -> Option<SyncMessage> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(message) = self.try_pop() {
                return Some(message);
            }
            self.notify.notified().await;
        }
    }

    /// Drop pending messages and wake the writer so it exits.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut lanes) = self.lanes.lock() {
            lanes.iter_mut().for_each(VecDeque::clear);
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lanes
            .lock()
            .map(|lanes| lanes.iter().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn id(n: u8) -> ValueId {
        ValueId::from_bytes([n; 32])
    }

    fn done(n: u8) -> SyncMessage {
        SyncMessage::Done { id: id(n) }
    }

    #[test]
    fn test_priority_for_kind() {
        assert_eq!(Priority::for_kind(ValueKind::Group), Priority::High);
        assert_eq!(Priority::for_kind(ValueKind::Account), Priority::High);
        assert_eq!(Priority::for_kind(ValueKind::BinaryStream), Priority::Low);
        assert_eq!(Priority::for_kind(ValueKind::Map), Priority::Medium);
        assert_eq!(Priority::for_kind(ValueKind::PlainText), Priority::Medium);
    }

    #[test]
    fn test_queue_dedupes_and_orders() {
        let mut queue = SyncQueue::new();
        assert!(queue.push(id(1), Priority::Low));
        assert!(queue.push(id(2), Priority::Medium));
        assert!(!queue.push(id(1), Priority::Low));
        assert!(queue.push(id(3), Priority::High));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.drain(), vec![id(3), id(2), id(1)]);
        assert!(queue.is_empty());
        assert!(queue.push(id(1), Priority::Low));
    }

    #[test]
    fn test_outbox_rechecks_higher_lanes() {
        let outbox = PeerOutbox::new();
        outbox.push(done(1), Priority::Low);
        outbox.push(done(2), Priority::Low);
        assert_eq!(outbox.try_pop(), Some(done(1)));

        outbox.push(done(3), Priority::High);
        assert_eq!(outbox.try_pop(), Some(done(3)));
        assert_eq!(outbox.try_pop(), Some(done(2)));
        assert_eq!(outbox.try_pop(), None);
    }

    #[tokio::test]
    async fn test_outbox_wakes_writer() {
        let outbox = Arc::new(PeerOutbox::new());
        let writer = {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move { outbox.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        outbox.push(done(7), Priority::Medium);
        let got = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(done(7)));
    }

    #[tokio::test]
    async fn test_close_ends_writer() {
        let outbox = Arc::new(PeerOutbox::new());
        outbox.push(done(1), Priority::Medium);
        outbox.close();
        assert!(outbox.is_empty());
        assert_eq!(outbox.next().await, None);
        outbox.push(done(2), Priority::Medium);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_push_to_poisoned_outbox_drops_message() {
        let outbox = Arc::new(PeerOutbox::new());
        let holder = Arc::clone(&outbox);
        let poisoned = std::thread::spawn(move || {
            let _lanes = holder.lanes.lock().unwrap();
            panic!("writer panicked while holding the lanes");
        })
        .join();
        assert!(poisoned.is_err());

        outbox.push(done(1), Priority::High);
        assert_eq!(outbox.try_pop(), None);
        assert_eq!(outbox.len(), 0);
    }
}
