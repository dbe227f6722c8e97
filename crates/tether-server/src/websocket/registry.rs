//! Connection registry: primary map plus identity/session/topic indices.
//!
//! All index mutation happens inside one `parking_lot::RwLock` write section
//! per operation, so the primary map and every index always agree. The lock
//! is never held across an `.await`: sends snapshot `Arc<Connection>` handles
//! under a read section and deliver after releasing it.
//!
//! Delivery failures are contained here. A connection whose transport fails
//! is disconnected and the failure is logged; callers only learn how many
//! connections the message reached.

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::Serialize;
use tether_core::{ConnectionId, SessionId};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::transport::{Transport, TransportError};

/// Default age after which a connection without a liveness ack is reaped.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(30);

/// Registry lookup failure.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No active connection has this ID.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),
}

/// One addressing primitive for [`ConnectionRegistry::send_to_targets`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Exactly one connection.
    Connection(ConnectionId),
    /// Every connection of an identity.
    Identity(String),
    /// Every connection bound to a session.
    Session(SessionId),
    /// Every subscriber of a topic.
    Topic(String),
    /// Every active connection.
    All,
}

struct Entry {
    handle: Arc<Connection>,
    session: Option<SessionId>,
    subscriptions: HashSet<String>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Entry>,
    by_identity: HashMap<String, HashSet<ConnectionId>>,
    by_session: HashMap<SessionId, HashSet<ConnectionId>>,
    by_topic: HashMap<String, HashSet<ConnectionId>>,
}

fn index_insert<K: Hash + Eq>(
    index: &mut HashMap<K, HashSet<ConnectionId>>,
    key: K,
    id: &ConnectionId,
) {
    let _ = index.entry(key).or_default().insert(id.clone());
}

/// Remove `id` under `key`, dropping the entry once its set is empty.
fn index_remove<K, Q>(index: &mut HashMap<K, HashSet<ConnectionId>>, key: &Q, id: &ConnectionId)
where
    K: Hash + Eq + Borrow<Q>,
    Q: Hash + Eq + ?Sized,
{
    if let Some(members) = index.get_mut(key) {
        let _ = members.remove(id);
        if members.is_empty() {
            let _ = index.remove(key);
        }
    }
}

fn index_count<K, Q>(index: &HashMap<K, HashSet<ConnectionId>>, key: &Q) -> usize
where
    K: Hash + Eq + Borrow<Q>,
    Q: Hash + Eq + ?Sized,
{
    index.get(key).map_or(0, HashSet::len)
}

impl RegistryState {
    fn handles<'a>(&self, ids: impl IntoIterator<Item = &'a ConnectionId>) -> Vec<Arc<Connection>> {
        ids.into_iter()
            .filter_map(|id| self.connections.get(id))
            .map(|e| Arc::clone(&e.handle))
            .collect()
    }

    fn members_of(&self, target: &Target) -> Vec<Arc<Connection>> {
        match target {
            Target::Connection(id) => self.handles([id]),
            Target::Identity(identity) => self
                .by_identity
                .get(identity.as_str())
                .map_or_else(Vec::new, |ids| self.handles(ids)),
            Target::Session(session) => self
                .by_session
                .get(session)
                .map_or_else(Vec::new, |ids| self.handles(ids)),
            Target::Topic(topic) => self
                .by_topic
                .get(topic.as_str())
                .map_or_else(Vec::new, |ids| self.handles(ids)),
            Target::All => self.handles(self.connections.keys()),
        }
    }
}

/// Active connections and their identity, session and topic indices.
#[derive(Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Run the transport handshake and register a new connection.
    pub async fn connect(
        &self,
        transport: Arc<dyn Transport>,
        identity: impl Into<String>,
        session: Option<SessionId>,
    ) -> Result<ConnectionId, TransportError> {
        transport.accept().await?;

        let identity = identity.into();
        let id = ConnectionId::new();
        let handle = Arc::new(Connection::new(id.clone(), identity.clone(), transport));

        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            index_insert(&mut state.by_identity, identity.clone(), &id);
            if let Some(ref s) = session {
                index_insert(&mut state.by_session, s.clone(), &id);
            }
            let _ = state.connections.insert(
                id.clone(),
                Entry {
                    handle,
                    session: session.clone(),
                    subscriptions: HashSet::new(),
                },
            );
        }

        counter!("ws_connections_total").increment(1);
        gauge!("ws_connections_active").increment(1.0);
        info!(
            conn_id = %id,
            identity = %identity,
            session_id = session.as_ref().map_or("", SessionId::as_str),
            "connection registered"
        );
        Ok(id)
    }

    /// Remove a connection and every index entry it owns, then signal its
    /// close token. No-op if the connection is already gone.
    pub fn disconnect(&self, id: &ConnectionId) {
        let removed = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let Some(entry) = state.connections.remove(id) else {
                return;
            };
            index_remove(&mut state.by_identity, entry.handle.identity(), id);
            if let Some(ref s) = entry.session {
                index_remove(&mut state.by_session, s, id);
            }
            for topic in &entry.subscriptions {
                index_remove(&mut state.by_topic, topic.as_str(), id);
            }
            entry
        };

        removed.handle.close();
        gauge!("ws_connections_active").decrement(1.0);
        info!(
            conn_id = %id,
            identity = removed.handle.identity(),
            age_secs = removed.handle.age().as_secs(),
            "connection removed"
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Delivery
    // ─────────────────────────────────────────────────────────────────────

    /// Send to one connection. Returns whether it was delivered.
    pub async fn send_to_connection(&self, id: &ConnectionId, message: &impl Serialize) -> bool {
        self.send_to_targets(&[Target::Connection(id.clone())], message)
            .await
            == 1
    }

    /// Send to every connection of `identity`. Returns the delivered count.
    pub async fn send_to_identity(&self, identity: &str, message: &impl Serialize) -> usize {
        self.send_to_targets(&[Target::Identity(identity.to_string())], message)
            .await
    }

    /// Send to every connection bound to `session`.
    pub async fn send_to_session(&self, session: &SessionId, message: &impl Serialize) -> usize {
        self.send_to_targets(&[Target::Session(session.clone())], message)
            .await
    }

    /// Send to every subscriber of `topic`.
    pub async fn send_to_topic(&self, topic: &str, message: &impl Serialize) -> usize {
        self.send_to_targets(&[Target::Topic(topic.to_string())], message)
            .await
    }

    /// Send to every active connection.
    pub async fn broadcast(&self, message: &impl Serialize) -> usize {
        self.send_to_targets(&[Target::All], message).await
    }

    /// Send once to every connection matched by any of `targets`.
    ///
    /// Membership is snapshotted before the first send. Each connection is
    /// delivered to independently; a failing one is disconnected without
    /// affecting the rest.
    pub async fn send_to_targets(&self, targets: &[Target], message: &impl Serialize) -> usize {
        let payload: Arc<str> = match serde_json::to_string(message) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound message");
                return 0;
            }
        };

        let recipients = {
            let state = self.state.read();
            let mut seen = HashSet::new();
            let mut recipients = Vec::new();
            for target in targets {
                for handle in state.members_of(target) {
                    if seen.insert(handle.id().clone()) {
                        recipients.push(handle);
                    }
                }
            }
            recipients
        };

        if recipients.is_empty() {
            debug!(?targets, "no recipients");
            return 0;
        }

        let results = join_all(
            recipients
                .iter()
                .map(|handle| self.deliver(handle, Arc::clone(&payload))),
        )
        .await;
        results.into_iter().filter(|delivered| *delivered).count()
    }

    async fn deliver(&self, handle: &Arc<Connection>, payload: Arc<str>) -> bool {
        match handle.send(payload).await {
            Ok(()) => {
                counter!("ws_messages_sent_total").increment(1);
                true
            }
            Err(e) => {
                counter!("ws_send_failures_total").increment(1);
                warn!(conn_id = %handle.id(), error = %e, "send failed, disconnecting");
                self.disconnect(handle.id());
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mutation
    // ─────────────────────────────────────────────────────────────────────

    /// Subscribe to `topic`. Returns `false` if already subscribed.
    pub fn subscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let entry = state
            .connections
            .get_mut(id)
            .ok_or_else(|| RegistryError::ConnectionNotFound(id.clone()))?;
        if !entry.subscriptions.insert(topic.to_string()) {
            return Ok(false);
        }
        index_insert(&mut state.by_topic, topic.to_string(), id);
        debug!(conn_id = %id, topic, "subscribed");
        Ok(true)
    }

    /// Unsubscribe from `topic`. Returns `false` if not subscribed.
    pub fn unsubscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let entry = state
            .connections
            .get_mut(id)
            .ok_or_else(|| RegistryError::ConnectionNotFound(id.clone()))?;
        if !entry.subscriptions.remove(topic) {
            return Ok(false);
        }
        index_remove(&mut state.by_topic, topic, id);
        debug!(conn_id = %id, topic, "unsubscribed");
        Ok(true)
    }

    /// Move the connection to `session`. Returns the previous session.
    pub fn rebind_session(
        &self,
        id: &ConnectionId,
        session: SessionId,
    ) -> Result<Option<SessionId>, RegistryError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let entry = state
            .connections
            .get_mut(id)
            .ok_or_else(|| RegistryError::ConnectionNotFound(id.clone()))?;
        if entry.session.as_ref() == Some(&session) {
            return Ok(Some(session));
        }
        let previous = entry.session.replace(session.clone());
        if let Some(ref old) = previous {
            index_remove(&mut state.by_session, old, id);
        }
        index_insert(&mut state.by_session, session.clone(), id);
        debug!(
            conn_id = %id,
            session_id = %session,
            previous = previous.as_ref().map_or("", SessionId::as_str),
            "session rebound"
        );
        Ok(previous)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Liveness
    // ─────────────────────────────────────────────────────────────────────

    /// Send a keep-alive ping and optimistically stamp the ack.
    ///
    /// A failed ping disconnects the connection.
    pub async fn liveness_probe(&self, id: &ConnectionId) -> Result<(), RegistryError> {
        let handle = self
            .handle(id)
            .ok_or_else(|| RegistryError::ConnectionNotFound(id.clone()))?;
        if self.ping(&handle).await {
            handle.mark_alive();
        }
        Ok(())
    }

    /// Ping without stamping. Returns whether the ping was handed off.
    pub(crate) async fn ping(&self, handle: &Arc<Connection>) -> bool {
        match handle.ping().await {
            Ok(()) => true,
            Err(e) => {
                counter!("ws_send_failures_total").increment(1);
                debug!(conn_id = %handle.id(), error = %e, "ping failed, disconnecting");
                self.disconnect(handle.id());
                false
            }
        }
    }

    /// Record that the peer answered (pong or any inbound frame).
    pub fn record_liveness_ack(&self, id: &ConnectionId) -> Result<(), RegistryError> {
        let handle = self
            .handle(id)
            .ok_or_else(|| RegistryError::ConnectionNotFound(id.clone()))?;
        handle.mark_alive();
        Ok(())
    }

    /// Disconnect every connection whose last ack is older than `threshold`.
    /// Returns the reaped IDs.
    pub fn reap_stale(&self, threshold: Duration) -> Vec<ConnectionId> {
        let stale: Vec<ConnectionId> = {
            let state = self.state.read();
            state
                .connections
                .values()
                .filter(|e| e.handle.since_last_ack() > threshold)
                .map(|e| e.handle.id().clone())
                .collect()
        };

        for id in &stale {
            info!(conn_id = %id, threshold_secs = threshold.as_secs(), "reaping stale connection");
            self.disconnect(id);
        }
        if !stale.is_empty() {
            counter!("ws_connections_reaped_total").increment(stale.len() as u64);
        }
        stale
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Handle for an active connection.
    pub fn handle(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.state
            .read()
            .connections
            .get(id)
            .map(|e| Arc::clone(&e.handle))
    }

    /// Handles for every active connection.
    pub fn handles(&self) -> Vec<Arc<Connection>> {
        self.state.read().members_of(&Target::All)
    }

    /// Whether `id` is active.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.state.read().connections.contains_key(id)
    }

    /// Active connection IDs, sorted.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.state.read().connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Session of `id`, if bound.
    pub fn session_of(&self, id: &ConnectionId) -> Option<SessionId> {
        self.state
            .read()
            .connections
            .get(id)
            .and_then(|e| e.session.clone())
    }

    /// Topics `id` is subscribed to, sorted. `None` if not active.
    pub fn subscriptions(&self, id: &ConnectionId) -> Option<Vec<String>> {
        let state = self.state.read();
        let entry = state.connections.get(id)?;
        let mut topics: Vec<String> = entry.subscriptions.iter().cloned().collect();
        topics.sort();
        Some(topics)
    }

    /// Number of active connections.
    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Connections of `identity`.
    pub fn identity_connection_count(&self, identity: &str) -> usize {
        index_count(&self.state.read().by_identity, identity)
    }

    /// Connections bound to `session`.
    pub fn session_connection_count(&self, session: &SessionId) -> usize {
        index_count(&self.state.read().by_session, session)
    }

    /// Subscribers of `topic`.
    pub fn topic_subscriber_count(&self, topic: &str) -> usize {
        index_count(&self.state.read().by_topic, topic)
    }

    /// Number of distinct sessions with at least one connection.
    pub fn session_count(&self) -> usize {
        self.state.read().by_session.len()
    }

    /// Number of distinct identities with at least one connection.
    pub fn identity_count(&self) -> usize {
        self.state.read().by_identity.len()
    }
}
