//! Storage exposed as a sync peer.
//!
//! The node talks to its storage with the same four messages it uses for
//! network peers, so loading from disk and loading from a server follow one
//! code path. The storage peer runs on its own task: slow disk never holds
//! up network traffic.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;

use cosync_core::{ContentMessage, KnownState, ValueId};
use cosync_store::{StoreOutcome, ValueStore};

use crate::error::SyncError;
use crate::messages::SyncMessage;
use crate::transport::{PeerConnection, PeerSink};

/// Answers sync messages from a [`ValueStore`].
#[derive(Clone)]
pub struct StoragePeer {
    store: Arc<dyn ValueStore>,
}

impl StoragePeer {
    pub fn new(store: Arc<dyn ValueStore>) -> Self {
        Self { store }
    }

    /// Replies to one message.
    ///
    /// Storage faults are logged and produce no reply; the requester may
    /// retry. Nothing here touches other values.
    pub async fn handle(&self, message: SyncMessage) -> Vec<SyncMessage> {
        self.reply(message, false).await
    }

    /// `admitted` means the caller already holds a write slot.
    async fn reply(&self, message: SyncMessage, admitted: bool) -> Vec<SyncMessage> {
        match message {
            SyncMessage::Load(known) => self.serve_load(known).await,
            SyncMessage::Content(content) => self.persist(content, admitted).await,
            SyncMessage::Known { .. } | SyncMessage::Done { .. } => Vec::new(),
        }
    }

    async fn serve_load(&self, requester: KnownState) -> Vec<SyncMessage> {
        let id = requester.id;
        let messages = match self.store.load(id).await {
            Ok(Some(messages)) => messages,
            Ok(None) => return vec![SyncMessage::known(KnownState::empty(id))],
            Err(e) => {
                tracing::error!(value = %id, error = %e, "storage load failed");
                return Vec::new();
            }
        };

        let mut stored = KnownState::empty(id);
        for message in &messages {
            stored.combine_with(&message.resulting_known());
        }

        let mut replies = vec![SyncMessage::known(stored)];
        replies.extend(
            messages
                .into_iter()
                .filter_map(|message| missing_from(message, &requester))
                .map(SyncMessage::Content),
        );
        replies
    }

    async fn persist(&self, content: ContentMessage, admitted: bool) -> Vec<SyncMessage> {
        let id = content.id;
        let outcome = if admitted {
            self.store.store_admitted(content).await
        } else {
            self.store.store(content).await
        };
        match outcome {
            Ok(StoreOutcome::Stored(known)) => vec![SyncMessage::known(known)],
            Ok(StoreOutcome::Mismatch(known)) => {
                tracing::warn!(value = %id, "stored prefix differs from sender's view");
                vec![SyncMessage::correction(known)]
            }
            Err(e) => {
                tracing::error!(value = %id, error = %e, "storage write failed");
                Vec::new()
            }
        }
    }

    /// Serve a connection until it closes.
    ///
    /// Each message is answered on a task of its own, chained after the
    /// previous message for the same value so one value's writes land in
    /// order. When the store bounds its writes, the next message is not
    /// read until a write slot is free.
    pub fn spawn(self, connection: PeerConnection) -> JoinHandle<()> {
        let PeerConnection { sink, mut source } = connection;
        let sink: Arc<dyn PeerSink> = Arc::from(sink);
        let limiter = self.store.write_limiter();
        tokio::spawn(async move {
            let mut chains: HashMap<ValueId, JoinHandle<()>> = HashMap::new();
            loop {
                let message = match source.recv().await {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(SyncError::InvalidMessage(reason)) => {
                        tracing::warn!(%reason, "storage peer dropped invalid message");
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "storage peer connection failed");
                        break;
                    }
                };
                if matches!(message, SyncMessage::Known { .. } | SyncMessage::Done { .. }) {
                    continue;
                }

                let permit = match (&message, &limiter) {
                    (SyncMessage::Content(_), Some(limiter)) => match limiter.acquire().await {
                        Ok(permit) => Some(permit),
                        Err(e) => {
                            tracing::error!(error = %e, "storage write limiter closed");
                            break;
                        }
                    },
                    _ => None,
                };

                let id = message.value_id();
                chains.retain(|_, task| !task.is_finished());
                let previous = chains.remove(&id);
                let peer = self.clone();
                let sink = Arc::clone(&sink);
                let task = tokio::spawn(async move {
                    if let Some(previous) = previous {
                        let _ = previous.await;
                    }
                    let replies = peer.reply(message, permit.is_some()).await;
                    drop(permit);
                    for reply in replies {
                        if sink.send(reply).await.is_err() {
                            return;
                        }
                    }
                });
                chains.insert(id, task);
            }
            for (_, task) in chains {
                let _ = task.await;
            }
            tracing::debug!("storage peer stopped");
        })
    }
}

/// The part of a stored message the requester lacks, if any.
///
/// Pieces that overlap the requester's holdings are kept whole; the
/// receiver skips the prefix it already has.
fn missing_from(mut message: ContentMessage, requester: &KnownState) -> Option<ContentMessage> {
    if requester.header {
        message.header = None;
    }
    message.new.retain(|session, piece| {
        piece.after + piece.new_transactions.len() as u32 > requester.count(session)
    });
    (!message.is_empty()).then_some(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageLimits;
    use crate::transport::memory;
    use cosync_core::{
        AgentSecret, Change, DefaultCrypto, CryptoProvider, Ruleset, SessionId, Transaction,
        ValueCore, ValueHeader, ValueKind,
    };
    use async_trait::async_trait;
    use cosync_store::{
        AsyncStorage, AsyncStorageDriver, MemoryDriver, StorageConfig, StorageDriver, StorageTx,
        SyncStorage,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn storage() -> StoragePeer {
        StoragePeer::new(Arc::new(SyncStorage::new(
            MemoryDriver::new(),
            StorageConfig::default(),
        )))
    }

    fn push(core: &mut ValueCore, session: SessionId, n: u32) {
        let secret = AgentSecret::from_seed(&[5; 32]);
        let tx = Transaction::trusting(
            n as u64,
            &[Change::MapSet {
                key: format!("k{n}"),
                value: json!(n),
            }],
        )
        .unwrap();
        core.append_local(&DefaultCrypto, &secret, session, tx);
    }

    fn value_with(count: u32) -> (ValueCore, SessionId) {
        let secret = AgentSecret::from_seed(&[5; 32]);
        let session = SessionId::new_random(DefaultCrypto.agent_id(&secret));
        let mut core = ValueCore::new(ValueHeader::new(ValueKind::Map, Ruleset::UnsafeAllowAll, 0));
        for n in 0..count {
            push(&mut core, session, n);
        }
        (core, session)
    }

    /// Memory storage whose transactions take a while. Records how many
    /// ran at once.
    struct SlowDriver {
        inner: MemoryDriver,
        active: AtomicUsize,
        peak: Arc<AtomicUsize>,
    }

    impl SlowDriver {
        fn new(peak: Arc<AtomicUsize>) -> Self {
            Self {
                inner: MemoryDriver::new(),
                active: AtomicUsize::new(0),
                peak,
            }
        }
    }

    #[async_trait]
    impl AsyncStorageDriver for SlowDriver {
        async fn transaction<T, F>(&self, f: F) -> cosync_store::Result<T>
        where
            F: FnOnce(&mut dyn StorageTx) -> cosync_store::Result<T> + Send + 'static,
            T: Send + 'static,
        {
            let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let result = StorageDriver::transaction(&self.inner, f);
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn slow_storage(
        max_parallel_writes: usize,
    ) -> (Arc<AsyncStorage<SlowDriver>>, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let store = AsyncStorage::new(
            SlowDriver::new(Arc::clone(&peak)),
            StorageConfig {
                max_parallel_writes,
                ..StorageConfig::default()
            },
        );
        (Arc::new(store), peak)
    }

    #[tokio::test]
    async fn test_load_unknown_value() {
        let peer = storage();
        let (core, _) = value_with(0);
        let replies = peer.handle(SyncMessage::Load(KnownState::empty(core.id()))).await;
        assert_eq!(replies, vec![SyncMessage::known(KnownState::empty(core.id()))]);
    }

    #[tokio::test]
    async fn test_store_then_load() {
        let peer = storage();
        let (core, session) = value_with(3);
        for message in core.new_content_since(None) {
            let replies = peer.handle(SyncMessage::Content(message)).await;
            assert!(matches!(&replies[..], [SyncMessage::Known { is_correction: false, .. }]));
        }

        let replies = peer.handle(SyncMessage::Load(KnownState::empty(core.id()))).await;
        assert_eq!(replies[0], SyncMessage::known(core.known_state()));
        let SyncMessage::Content(content) = &replies[1] else {
            panic!("expected content");
        };
        assert!(content.header.is_some());
        assert_eq!(content.new[&session].new_transactions.len(), 3);

        // A requester that already has everything gets only the known state.
        let replies = peer.handle(SyncMessage::Load(core.known_state())).await;
        assert_eq!(replies, vec![SyncMessage::known(core.known_state())]);
    }

    #[tokio::test]
    async fn test_mismatch_answers_with_correction() {
        let peer = storage();
        let (core, session) = value_with(4);
        let mut assumed = KnownState::empty(core.id());
        assumed.header = true;
        assumed.sessions.insert(session, 2);
        let mut content = core.new_content_since(Some(&assumed)).remove(0);
        content.header = Some(core.header().clone());

        let replies = peer.handle(SyncMessage::Content(content)).await;
        assert!(matches!(
            &replies[..],
            [SyncMessage::Known { is_correction: true, known }] if known.count(&session) == 0
        ));
    }

    #[tokio::test]
    async fn test_spawned_peer_serves_connection() {
        let (node_end, storage_end) = memory::pair(MessageLimits::default());
        let task = storage().spawn(storage_end);
        let (core, _) = value_with(1);
        let PeerConnection { sink, mut source } = node_end;

        for message in core.new_content_since(None) {
            sink.send(SyncMessage::Content(message)).await.unwrap();
        }
        assert_eq!(
            source.recv().await.unwrap(),
            Some(SyncMessage::known(core.known_state()))
        );

        sink.close().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_peer_bounds_parallel_writes() {
        let (store, peak) = slow_storage(2);
        let (node_end, storage_end) = memory::pair(MessageLimits::default());
        let task = StoragePeer::new(store.clone()).spawn(storage_end);
        let PeerConnection { sink, mut source } = node_end;

        let values: Vec<ValueCore> = (0..6).map(|_| value_with(1).0).collect();
        for core in &values {
            for message in core.new_content_since(None) {
                sink.send(SyncMessage::Content(message)).await.unwrap();
            }
        }

        let mut acked = Vec::new();
        for _ in 0..values.len() {
            assert!(store.limiter().in_flight() <= 2);
            match source.recv().await.unwrap() {
                Some(SyncMessage::Known {
                    is_correction: false,
                    known,
                }) => acked.push(known.id),
                other => panic!("expected an ack, got {other:?}"),
            }
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(store.limiter().in_flight(), 0);
        for core in &values {
            assert!(acked.contains(&core.id()));
        }

        sink.close().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_peer_keeps_one_value_in_order() {
        let (store, _) = slow_storage(4);
        let (node_end, storage_end) = memory::pair(MessageLimits::default());
        let task = StoragePeer::new(store).spawn(storage_end);
        let PeerConnection { sink, mut source } = node_end;

        let (mut core, session) = value_with(0);
        let mut known = None;
        for n in 0..4 {
            push(&mut core, session, n);
            for message in core.new_content_since(known.as_ref()) {
                sink.send(SyncMessage::Content(message)).await.unwrap();
            }
            known = Some(core.known_state());
        }

        for n in 1..=4 {
            match source.recv().await.unwrap() {
                Some(SyncMessage::Known {
                    is_correction: false,
                    known,
                }) => assert_eq!(known.count(&session), n),
                other => panic!("expected an ack, got {other:?}"),
            }
        }

        sink.close().await;
        task.await.unwrap();
    }
}
