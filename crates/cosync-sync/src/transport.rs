//! Transport abstraction for the sync protocol.
//!
//! A peer connection is a pair of halves: a sink the writer task sends
//! through and a source the pump task reads from. Implementations may use
//! WebSockets, HTTP, or anything else that delivers messages in order.

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::SyncMessage;

/// Sending half of a peer connection.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait PeerSink: Send + Sync {
    /// Send one message. Errors mean the connection is gone.
    async fn send(&self, message: SyncMessage) -> Result<()>;

    /// Close the connection. Pending sends may be dropped.
    async fn close(&self) {}
}

/// Receiving half of a peer connection.
#[async_trait]
pub trait PeerSource: Send {
    /// Receive the next message.
    ///
    /// `Ok(None)` means the connection closed cleanly. An
    /// [`InvalidMessage`](crate::SyncError::InvalidMessage) error covers one
    /// bad frame; the caller may keep reading.
    async fn recv(&mut self) -> Result<Option<SyncMessage>>;
}

/// Both halves of a connection to one peer.
pub struct PeerConnection {
    pub sink: Box<dyn PeerSink>,
    pub source: Box<dyn PeerSource>,
}

impl PeerConnection {
    pub fn new(sink: impl PeerSink + 'static, source: impl PeerSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

/// In-memory connections for tests and same-process peers.
///
/// Frames travel as encoded CBOR so the wire codec and its limits are
/// exercised exactly as over a network.
pub mod memory {
    use super::*;
    use crate::error::SyncError;
    use crate::messages::MessageLimits;
    use bytes::Bytes;
    use tokio::sync::{mpsc, Mutex};

    /// Sending half backed by a channel.
    pub struct MemorySink {
        tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    }

    #[async_trait]
    impl PeerSink for MemorySink {
        async fn send(&self, message: SyncMessage) -> Result<()> {
            let frame = Bytes::from(message.to_bytes()?);
            let tx = self.tx.lock().await;
            let tx = tx
                .as_ref()
                .ok_or_else(|| SyncError::TransportError("connection closed".into()))?;
            tx.send(frame)
                .map_err(|_| SyncError::TransportError("peer disconnected".into()))
        }

        async fn close(&self) {
            self.tx.lock().await.take();
        }
    }

    /// Receiving half backed by a channel.
    pub struct MemorySource {
        rx: mpsc::UnboundedReceiver<Bytes>,
        limits: MessageLimits,
    }

    #[async_trait]
    impl PeerSource for MemorySource {
        async fn recv(&mut self) -> Result<Option<SyncMessage>> {
            match self.rx.recv().await {
                Some(frame) => SyncMessage::from_bytes(&frame, &self.limits).map(Some),
                None => Ok(None),
            }
        }
    }

    /// Raw frame injection, for feeding a source bytes no sink would send.
    pub struct FrameInjector {
        tx: mpsc::UnboundedSender<Bytes>,
    }

    impl FrameInjector {
        pub fn inject(&self, frame: Bytes) -> Result<()> {
            self.tx
                .send(frame)
                .map_err(|_| SyncError::TransportError("peer disconnected".into()))
        }
    }

    fn half(limits: MessageLimits) -> (MemorySink, MemorySource) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemorySink {
                tx: Mutex::new(Some(tx)),
            },
            MemorySource { rx, limits },
        )
    }

    /// Two connected ends. What one end's sink sends, the other's source
    /// receives.
    pub fn pair(limits: MessageLimits) -> (PeerConnection, PeerConnection) {
        let (a_sink, b_source) = half(limits);
        let (b_sink, a_source) = half(limits);
        (
            PeerConnection::new(a_sink, a_source),
            PeerConnection::new(b_sink, b_source),
        )
    }

    /// A source plus an injector writing straight into it.
    pub fn source_with_injector(limits: MessageLimits) -> (MemorySource, FrameInjector) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MemorySource { rx, limits }, FrameInjector { tx })
    }
}
