//! One live duplex connection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_core::ConnectionId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::transport::{Transport, TransportError};

/// A registered connection.
///
/// Index membership (session, subscriptions) lives in the registry; this
/// handle carries what a send needs and can be used after the registry's
/// lock is released.
pub struct Connection {
    id: ConnectionId,
    identity: String,
    transport: Arc<dyn Transport>,
    /// FIFO: `tokio::sync::Mutex` wakes waiters in order.
    send_lock: tokio::sync::Mutex<()>,
    connected_at: Instant,
    last_liveness_ack: Mutex<Instant>,
    closed: CancellationToken,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, identity: String, transport: Arc<dyn Transport>) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity,
            transport,
            send_lock: tokio::sync::Mutex::new(()),
            connected_at: now,
            last_liveness_ack: Mutex::new(now),
            closed: CancellationToken::new(),
        }
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Authenticated identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// When the connection was registered.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Time since the last liveness acknowledgement.
    pub fn since_last_ack(&self) -> Duration {
        self.last_liveness_ack.lock().elapsed()
    }

    /// Stamp the liveness acknowledgement with the current instant.
    pub fn mark_alive(&self) {
        *self.last_liveness_ack.lock() = Instant::now();
    }

    /// Send a text frame. Sends to one connection complete in call order.
    pub async fn send(&self, payload: Arc<str>) -> Result<(), TransportError> {
        let _guard = self.send_lock.lock().await;
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.transport.send_text(payload).await
    }

    /// Send a keep-alive ping.
    pub async fn ping(&self) -> Result<(), TransportError> {
        let _guard = self.send_lock.lock().await;
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.transport.send_ping().await
    }

    /// Token cancelled when the connection is disconnected.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Whether the connection has been disconnected.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
