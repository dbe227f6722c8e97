//! Transport seam between the registry and a concrete socket.
//!
//! The registry only ever pushes text and keep-alive pings. The production
//! [`ChannelTransport`] enqueues both onto a bounded `mpsc` queue that a
//! per-socket writer task drains, so a send never waits on the network.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Failure to hand a frame to the transport.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The outbound queue is full (slow consumer).
    #[error("outbound queue full")]
    QueueFull,
    /// The peer or writer task is gone.
    #[error("transport closed")]
    Closed,
    /// The transport-level handshake did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Outbound half of a connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Complete the transport's own handshake. Called once by
    /// `ConnectionRegistry::connect` before the connection is registered.
    async fn accept(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Push one text frame.
    async fn send_text(&self, payload: Arc<str>) -> Result<(), TransportError>;

    /// Push one keep-alive ping.
    async fn send_ping(&self) -> Result<(), TransportError>;
}

/// One frame read from the peer, reduced to what the session loop acts on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceivedFrame {
    /// A UTF-8 text (or UTF-8 binary) frame.
    Text(String),
    /// A ping or pong from the peer.
    Liveness,
    /// The peer asked to close.
    Close,
}

/// Inbound half of a connection.
#[async_trait]
pub trait InboundFrames: Send {
    /// Next frame, or `None` once the stream has ended.
    async fn receive_text(&mut self) -> Option<ReceivedFrame>;
}

#[async_trait]
impl InboundFrames for mpsc::Receiver<ReceivedFrame> {
    async fn receive_text(&mut self) -> Option<ReceivedFrame> {
        self.recv().await
    }
}

/// Frame queued for the writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized event.
    Text(Arc<str>),
    /// Keep-alive ping.
    Ping,
}

/// [`Transport`] backed by a bounded queue.
///
/// A full or closed queue is reported as a send failure instead of waiting.
#[derive(Clone, Debug)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelTransport {
    /// Create a transport and the receiver its writer task drains.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    fn push(&self, frame: Outbound) -> Result<(), TransportError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn accept(&self) -> Result<(), TransportError> {
        if self.tx.is_closed() {
            return Err(TransportError::Handshake("writer task already gone".into()));
        }
        Ok(())
    }

    async fn send_text(&self, payload: Arc<str>) -> Result<(), TransportError> {
        self.push(Outbound::Text(payload))
    }

    async fn send_ping(&self) -> Result<(), TransportError> {
        self.push(Outbound::Ping)
    }
}
