//! Typed event fan-out and inbound dispatch.
//!
//! Each outbound event kind maps to one registry addressing primitive.
//! Inbound frames are parsed into [`InboundMessage`]; registry-level requests
//! are answered here, application requests go to an [`ApplicationHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tether_core::{Classify, ConnectionId, ErrorKind, SessionId};
use tether_runtime::{RetryError, RetryPolicyEngine};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::events::{EventType, OutboundEvent};
use super::inbound::{InboundMessage, parse_frame};
use super::registry::{ConnectionRegistry, RegistryError, Target};

// ─────────────────────────────────────────────────────────────────────────────
// Application handler seam
// ─────────────────────────────────────────────────────────────────────────────

/// Application request kinds forwarded out of the router.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// `query`
    Query,
    /// `query_all`
    QueryAll,
    /// `status`
    Status,
}

impl RequestKind {
    fn reply_type(self) -> EventType {
        match self {
            Self::Query => EventType::QueryResult,
            Self::QueryAll => EventType::QueryAllResult,
            Self::Status => EventType::StatusResult,
        }
    }
}

/// A forwarded request and who sent it.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerRequest {
    /// Request kind.
    pub kind: RequestKind,
    /// Originating connection.
    pub connection_id: ConnectionId,
    /// Identity of the originating connection.
    pub identity: String,
    /// Session of the originating connection, if bound.
    pub session_id: Option<SessionId>,
    /// Frame fields other than `type` and `correlation_id`.
    pub payload: Value,
}

/// An application request taken off the read path, answered by
/// [`EventRouter::forward`].
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardedRequest {
    /// Echoed on the reply.
    pub correlation_id: Option<String>,
    /// What the handler sees.
    pub request: HandlerRequest,
}

/// Classified failure from an [`ApplicationHandler`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    /// Failure category.
    pub kind: ErrorKind,
    /// Message sent back to the client.
    pub message: String,
}

impl HandlerError {
    /// Create a handler error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Classify for HandlerError {
    fn error_kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<RetryError<HandlerError>> for HandlerError {
    fn from(err: RetryError<HandlerError>) -> Self {
        match err {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted {
                attempts,
                last_error,
            } => Self::new(
                last_error.kind,
                format!("{} (gave up after {attempts} attempts)", last_error.message),
            ),
            RetryError::UnknownServiceClass(class) => Self::new(
                ErrorKind::Internal,
                format!("no retry policy for service class '{class}'"),
            ),
            RetryError::Cancelled { .. } => Self::new(ErrorKind::Unavailable, "request cancelled"),
        }
    }
}

/// External collaborator answering `query`, `query_all` and `status`.
#[async_trait]
pub trait ApplicationHandler: Send + Sync + 'static {
    /// Answer one request with a JSON result.
    async fn handle(&self, request: HandlerRequest) -> Result<Value, HandlerError>;
}

/// Handler used when no application is attached. Fails every request with
/// a non-retryable [`ErrorKind::NotFound`].
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableHandler;

#[async_trait]
impl ApplicationHandler for UnavailableHandler {
    async fn handle(&self, request: HandlerRequest) -> Result<Value, HandlerError> {
        Err(HandlerError::new(
            ErrorKind::NotFound,
            format!("no application handler for {:?} requests", request.kind),
        ))
    }
}

/// Runs every request through the retry engine under one service class.
pub struct RetryingHandler {
    inner: Arc<dyn ApplicationHandler>,
    engine: Arc<RetryPolicyEngine>,
    service_class: String,
}

impl RetryingHandler {
    /// Default service class for forwarded requests.
    pub const DEFAULT_SERVICE_CLASS: &'static str = "llm";

    /// Wrap `inner` under [`Self::DEFAULT_SERVICE_CLASS`].
    pub fn new(inner: Arc<dyn ApplicationHandler>, engine: Arc<RetryPolicyEngine>) -> Self {
        Self {
            inner,
            engine,
            service_class: Self::DEFAULT_SERVICE_CLASS.to_string(),
        }
    }

    /// Use another service class.
    #[must_use]
    pub fn with_service_class(mut self, service_class: impl Into<String>) -> Self {
        self.service_class = service_class.into();
        self
    }

    /// The configured service class.
    pub fn service_class(&self) -> &str {
        &self.service_class
    }
}

#[async_trait]
impl ApplicationHandler for RetryingHandler {
    async fn handle(&self, request: HandlerRequest) -> Result<Value, HandlerError> {
        self.engine
            .execute(&self.service_class, || {
                let inner = Arc::clone(&self.inner);
                let request = request.clone();
                async move { inner.handle(request).await }
            })
            .await
            .map_err(HandlerError::from)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventRouter
// ─────────────────────────────────────────────────────────────────────────────

/// Typed events in, registry fan-out and replies out.
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ApplicationHandler>,
}

impl EventRouter {
    /// Router over `registry`, forwarding application requests to `handler`.
    pub fn new(registry: Arc<ConnectionRegistry>, handler: Arc<dyn ApplicationHandler>) -> Self {
        Self { registry, handler }
    }

    /// The registry events are routed through.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    async fn emit(&self, targets: &[Target], event_type: EventType, data: Value) -> usize {
        let event = OutboundEvent::new(event_type, data);
        let delivered = self.registry.send_to_targets(targets, &event).await;
        debug!(event_type = %event_type, delivered, "event routed");
        delivered
    }

    /// `execution_started` to the session and every connection of the
    /// identity, each connection at most once.
    pub async fn execution_started(
        &self,
        identity: &str,
        session: &SessionId,
        data: Value,
    ) -> usize {
        self.emit(
            &[
                Target::Session(session.clone()),
                Target::Identity(identity.to_string()),
            ],
            EventType::ExecutionStarted,
            data,
        )
        .await
    }

    /// `execution_progress` to the session.
    pub async fn execution_progress(&self, session: &SessionId, data: Value) -> usize {
        self.emit(&[Target::Session(session.clone())], EventType::ExecutionProgress, data)
            .await
    }

    /// `execution_completed` to the session.
    pub async fn execution_completed(&self, session: &SessionId, data: Value) -> usize {
        self.emit(&[Target::Session(session.clone())], EventType::ExecutionCompleted, data)
            .await
    }

    /// `execution_error` to the session.
    pub async fn execution_error(&self, session: &SessionId, data: Value) -> usize {
        self.emit(&[Target::Session(session.clone())], EventType::ExecutionError, data)
            .await
    }

    /// `message_created` to the session.
    pub async fn message_created(&self, session: &SessionId, data: Value) -> usize {
        self.emit(&[Target::Session(session.clone())], EventType::MessageCreated, data)
            .await
    }

    /// `session_updated` to the session.
    pub async fn session_updated(&self, session: &SessionId, data: Value) -> usize {
        self.emit(&[Target::Session(session.clone())], EventType::SessionUpdated, data)
            .await
    }

    /// `system_notification` to the identity if given, else the session if
    /// given, else everyone.
    pub async fn system_notification(
        &self,
        identity: Option<&str>,
        session: Option<&SessionId>,
        data: Value,
    ) -> usize {
        let target = match (identity, session) {
            (Some(identity), _) => Target::Identity(identity.to_string()),
            (None, Some(session)) => Target::Session(session.clone()),
            (None, None) => Target::All,
        };
        self.emit(&[target], EventType::SystemNotification, data).await
    }

    /// `connection_established` to a freshly registered connection.
    pub async fn connection_established(&self, id: &ConnectionId) -> bool {
        let Some(handle) = self.registry.handle(id) else {
            return false;
        };
        let data = json!({
            "connection_id": id,
            "identity": handle.identity(),
            "session_id": self.registry.session_of(id),
        });
        self.reply(id, None, EventType::ConnectionEstablished, data).await
    }

    async fn reply(
        &self,
        id: &ConnectionId,
        correlation_id: Option<String>,
        event_type: EventType,
        data: Value,
    ) -> bool {
        let event = OutboundEvent::new(event_type, data).with_correlation_id(correlation_id);
        self.registry.send_to_connection(id, &event).await
    }

    async fn reply_error(
        &self,
        id: &ConnectionId,
        correlation_id: Option<String>,
        code: &str,
        message: String,
    ) -> bool {
        let event = OutboundEvent::error(code, message).with_correlation_id(correlation_id);
        self.registry.send_to_connection(id, &event).await
    }

    /// Handle one inbound text frame from `id`.
    ///
    /// Registry-level messages are answered before this returns. Invalid
    /// frames get an `error` reply and the connection stays open.
    /// Application requests are returned unanswered so the caller can run
    /// [`Self::forward`] off its read path.
    #[instrument(skip_all, fields(conn_id = %id))]
    pub async fn handle_inbound(&self, id: &ConnectionId, text: &str) -> Option<ForwardedRequest> {
        let frame = parse_frame(text);
        let correlation_id = frame.correlation_id;
        let message = match frame.message {
            Ok(message) => message,
            Err(invalid) => {
                debug!(error = %invalid, "rejected inbound frame");
                let _ = self
                    .reply_error(id, correlation_id, invalid.code(), invalid.to_string())
                    .await;
                return None;
            }
        };
        debug!(message_type = message.type_name(), "inbound message");

        let result = match message {
            InboundMessage::Ping => Ok((EventType::Pong, json!({}))),
            InboundMessage::Subscribe { subscription } => self
                .registry
                .subscribe(id, &subscription)
                .map(|_| (EventType::Subscribed, json!({ "subscription": subscription }))),
            InboundMessage::Unsubscribe { subscription } => self
                .registry
                .unsubscribe(id, &subscription)
                .map(|_| (EventType::Unsubscribed, json!({ "subscription": subscription }))),
            InboundMessage::JoinSession { session_id } => self
                .registry
                .rebind_session(id, session_id.clone())
                .map(|previous| {
                    (
                        EventType::SessionJoined,
                        json!({ "session_id": session_id, "previous_session_id": previous }),
                    )
                }),
            InboundMessage::Query { payload } => {
                return self.lift(id, correlation_id, RequestKind::Query, payload);
            }
            InboundMessage::QueryAll { payload } => {
                return self.lift(id, correlation_id, RequestKind::QueryAll, payload);
            }
            InboundMessage::Status { payload } => {
                return self.lift(id, correlation_id, RequestKind::Status, payload);
            }
        };

        match result {
            Ok((event_type, data)) => {
                let _ = self.reply(id, correlation_id, event_type, data).await;
            }
            Err(RegistryError::ConnectionNotFound(_)) => {
                debug!("connection gone before reply");
            }
        }
        None
    }

    fn lift(
        &self,
        id: &ConnectionId,
        correlation_id: Option<String>,
        kind: RequestKind,
        payload: Value,
    ) -> Option<ForwardedRequest> {
        let Some(handle) = self.registry.handle(id) else {
            debug!("connection gone before forwarding");
            return None;
        };
        Some(ForwardedRequest {
            correlation_id,
            request: HandlerRequest {
                kind,
                connection_id: id.clone(),
                identity: handle.identity().to_string(),
                session_id: self.registry.session_of(id),
                payload,
            },
        })
    }

    /// Run a lifted request through the application handler and send the
    /// result (or an `error` frame) back to the originating connection.
    #[instrument(skip_all, fields(conn_id = %forwarded.request.connection_id))]
    pub async fn forward(&self, forwarded: ForwardedRequest) {
        let ForwardedRequest {
            correlation_id,
            request,
        } = forwarded;
        let (id, kind) = (request.connection_id.clone(), request.kind);

        let _ = match self.handler.handle(request).await {
            Ok(result) => self.reply(&id, correlation_id, kind.reply_type(), result).await,
            Err(e) => {
                warn!(
                    request = ?kind,
                    error_kind = %e.kind,
                    error = %e.message,
                    "application handler failed"
                );
                self.reply_error(&id, correlation_id, e.kind.as_str(), e.message)
                    .await
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::transport::{ChannelTransport, Outbound};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tether_runtime::PolicyCatalog;
    use tokio::sync::mpsc;

    struct EchoHandler {
        seen: Mutex<Vec<HandlerRequest>>,
    }

    #[async_trait]
    impl ApplicationHandler for EchoHandler {
        async fn handle(&self, request: HandlerRequest) -> Result<Value, HandlerError> {
            self.seen.lock().push(request.clone());
            if request.payload.get("fail").is_some() {
                return Err(HandlerError::new(ErrorKind::NotFound, "no such thing"));
            }
            Ok(json!({ "echo": request.payload }))
        }
    }

    struct Harness {
        router: EventRouter,
        registry: Arc<ConnectionRegistry>,
        handler: Arc<EchoHandler>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let handler = Arc::new(EchoHandler {
            seen: Mutex::new(Vec::new()),
        });
        let router = EventRouter::new(Arc::clone(&registry), handler.clone());
        Harness {
            router,
            registry,
            handler,
        }
    }

    async fn connect(
        registry: &ConnectionRegistry,
        identity: &str,
        session: Option<&str>,
    ) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (transport, rx) = ChannelTransport::new(16);
        let id = registry
            .connect(Arc::new(transport), identity, session.map(SessionId::from))
            .await
            .unwrap();
        (id, rx)
    }

    /// Answer a frame the way the session read loop does, but inline.
    async fn dispatch(router: &EventRouter, id: &ConnectionId, text: &str) {
        if let Some(forwarded) = router.handle_inbound(id, text).await {
            router.forward(forwarded).await;
        }
    }

    fn next(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match rx.try_recv() {
            Ok(Outbound::Text(t)) => serde_json::from_str(&t).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn execution_started_reaches_session_and_identity_once() {
        let h = harness();
        let (_a, mut in_session) = connect(&h.registry, "u1", Some("s1")).await;
        let (_b, mut other_tab) = connect(&h.registry, "u1", None).await;
        let (_c, mut stranger) = connect(&h.registry, "u2", Some("s1")).await;

        let delivered = h
            .router
            .execution_started("u1", &SessionId::from("s1"), json!({"run": 9}))
            .await;

        assert_eq!(delivered, 3);
        for rx in [&mut in_session, &mut other_tab, &mut stranger] {
            let frame = next(rx);
            assert_eq!(frame["type"], "execution_started");
            assert_eq!(frame["data"]["run"], 9);
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn session_events_stay_in_session() {
        let h = harness();
        let (_a, mut inside) = connect(&h.registry, "u1", Some("s1")).await;
        let (_b, mut outside) = connect(&h.registry, "u1", Some("s2")).await;
        let s1 = SessionId::from("s1");

        assert_eq!(h.router.execution_progress(&s1, json!({})).await, 1);
        assert_eq!(h.router.execution_completed(&s1, json!({})).await, 1);
        assert_eq!(h.router.execution_error(&s1, json!({})).await, 1);
        assert_eq!(h.router.message_created(&s1, json!({})).await, 1);
        assert_eq!(h.router.session_updated(&s1, json!({})).await, 1);

        let types: Vec<Value> = (0..5).map(|_| next(&mut inside)["type"].clone()).collect();
        assert_eq!(
            types,
            vec![
                json!("execution_progress"),
                json!("execution_completed"),
                json!("execution_error"),
                json!("message_created"),
                json!("session_updated"),
            ]
        );
        assert!(outside.try_recv().is_err());
    }

    #[tokio::test]
    async fn system_notification_addressing() {
        let h = harness();
        let (_a, mut u1) = connect(&h.registry, "u1", Some("s1")).await;
        let (_b, mut u2) = connect(&h.registry, "u2", Some("s2")).await;
        let s2 = SessionId::from("s2");

        assert_eq!(h.router.system_notification(Some("u1"), Some(&s2), json!({})).await, 1);
        assert_eq!(next(&mut u1)["type"], "system_notification");

        assert_eq!(h.router.system_notification(None, Some(&s2), json!({})).await, 1);
        assert_eq!(next(&mut u2)["type"], "system_notification");

        assert_eq!(h.router.system_notification(None, None, json!({})).await, 2);
    }

    #[tokio::test]
    async fn ping_gets_pong_with_correlation() {
        let h = harness();
        let (id, mut rx) = connect(&h.registry, "u1", None).await;
        dispatch(&h.router, &id, r#"{"type":"ping","correlation_id":"abc"}"#).await;
        let frame = next(&mut rx);
        assert_eq!(frame["type"], "pong");
        assert_eq!(frame["correlation_id"], "abc");
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_acknowledged() {
        let h = harness();
        let (id, mut rx) = connect(&h.registry, "u1", None).await;

        dispatch(&h.router, &id, r#"{"type":"subscribe","subscription":"news"}"#).await;
        assert_eq!(next(&mut rx)["type"], "subscribed");
        assert_eq!(h.registry.topic_subscriber_count("news"), 1);

        dispatch(&h.router, &id, r#"{"type":"unsubscribe","subscription":"news"}"#).await;
        let frame = next(&mut rx);
        assert_eq!(frame["type"], "unsubscribed");
        assert_eq!(frame["data"]["subscription"], "news");
        assert_eq!(h.registry.topic_subscriber_count("news"), 0);
    }

    #[tokio::test]
    async fn invalid_frames_get_error_and_change_nothing() {
        let h = harness();
        let (id, mut rx) = connect(&h.registry, "u1", None).await;

        dispatch(&h.router, &id, r#"{"type":"subscribe","correlation_id":"c9"}"#).await;
        let frame = next(&mut rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["code"], "missing_field");
        assert_eq!(frame["correlation_id"], "c9");
        assert_eq!(h.registry.subscriptions(&id), Some(vec![]));

        dispatch(&h.router, &id, r#"{"type":"warp"}"#).await;
        assert_eq!(next(&mut rx)["data"]["code"], "unknown_type");

        dispatch(&h.router, &id, "garbage").await;
        assert_eq!(next(&mut rx)["data"]["code"], "malformed_frame");

        assert!(h.registry.contains(&id));
    }

    #[tokio::test]
    async fn join_session_rebinds() {
        let h = harness();
        let (id, mut rx) = connect(&h.registry, "u1", Some("old")).await;
        let target = uuid::Uuid::now_v7().to_string();

        let frame = json!({"type": "join_session", "session_id": target}).to_string();
        dispatch(&h.router, &id, &frame).await;

        let frame = next(&mut rx);
        assert_eq!(frame["type"], "session_joined");
        assert_eq!(frame["data"]["session_id"], target.as_str());
        assert_eq!(frame["data"]["previous_session_id"], "old");
        assert_eq!(h.registry.session_of(&id), Some(SessionId::from(target.as_str())));
        assert_eq!(h.registry.session_connection_count(&SessionId::from("old")), 0);
    }

    #[tokio::test]
    async fn application_requests_are_forwarded() {
        let h = harness();
        let (id, mut rx) = connect(&h.registry, "u1", Some("s1")).await;

        let query = r#"{"type":"query","correlation_id":"q1","entity":"runs"}"#;
        dispatch(&h.router, &id, query).await;
        let frame = next(&mut rx);
        assert_eq!(frame["type"], "query_result");
        assert_eq!(frame["data"]["echo"]["entity"], "runs");
        assert_eq!(frame["correlation_id"], "q1");

        dispatch(&h.router, &id, r#"{"type":"query_all"}"#).await;
        assert_eq!(next(&mut rx)["type"], "query_all_result");

        dispatch(&h.router, &id, r#"{"type":"status","fail":true}"#).await;
        let frame = next(&mut rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["code"], "not_found");

        let seen = h.handler.seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].kind, RequestKind::Query);
        assert_eq!(seen[0].identity, "u1");
        assert_eq!(seen[0].session_id, Some(SessionId::from("s1")));
        assert_eq!(seen[2].kind, RequestKind::Status);
    }

    #[tokio::test]
    async fn only_application_requests_are_lifted() {
        let h = harness();
        let (id, mut rx) = connect(&h.registry, "u1", Some("s1")).await;

        assert!(h.router.handle_inbound(&id, r#"{"type":"ping"}"#).await.is_none());
        assert_eq!(next(&mut rx)["type"], "pong");

        let forwarded = h
            .router
            .handle_inbound(&id, r#"{"type":"status","correlation_id":7,"verbose":true}"#)
            .await
            .unwrap();
        assert_eq!(forwarded.correlation_id.as_deref(), Some("7"));
        assert_eq!(forwarded.request.kind, RequestKind::Status);
        assert_eq!(forwarded.request.connection_id, id);
        assert_eq!(forwarded.request.payload, json!({"verbose": true}));
        // Nothing is answered until the request is forwarded
        assert!(rx.try_recv().is_err());
        assert!(h.handler.seen.lock().is_empty());

        h.router.forward(forwarded).await;
        let frame = next(&mut rx);
        assert_eq!(frame["type"], "status_result");
        assert_eq!(frame["correlation_id"], "7");
    }

    #[tokio::test]
    async fn request_from_departed_connection_is_dropped() {
        let h = harness();
        let (id, _rx) = connect(&h.registry, "u1", None).await;
        h.registry.disconnect(&id);
        assert!(h.router.handle_inbound(&id, r#"{"type":"query"}"#).await.is_none());
        assert!(h.handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn connection_established_describes_connection() {
        let h = harness();
        let (id, mut rx) = connect(&h.registry, "u1", Some("s1")).await;
        assert!(h.router.connection_established(&id).await);
        let frame = next(&mut rx);
        assert_eq!(frame["type"], "connection_established");
        assert_eq!(frame["data"]["connection_id"], id.as_str());
        assert_eq!(frame["data"]["identity"], "u1");
        assert_eq!(frame["data"]["session_id"], "s1");
    }

    struct FlakyHandler {
        calls: AtomicU32,
        fail_times: u32,
        kind: ErrorKind,
    }

    #[async_trait]
    impl ApplicationHandler for FlakyHandler {
        async fn handle(&self, _request: HandlerRequest) -> Result<Value, HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_times {
                Err(HandlerError::new(self.kind, format!("failure {n}")))
            } else {
                Ok(json!({ "calls": n }))
            }
        }
    }

    fn request() -> HandlerRequest {
        HandlerRequest {
            kind: RequestKind::Query,
            connection_id: ConnectionId::from("c"),
            identity: "u1".into(),
            session_id: None,
            payload: json!({}),
        }
    }

    fn engine() -> Arc<RetryPolicyEngine> {
        Arc::new(RetryPolicyEngine::new(Arc::new(PolicyCatalog::defaults().unwrap())))
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_handler_retries_transient_failures() {
        let flaky = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            fail_times: 2,
            kind: ErrorKind::RateLimited,
        });
        let handler = RetryingHandler::new(flaky.clone(), engine());
        assert_eq!(handler.service_class(), "llm");

        let result = handler.handle(request()).await.unwrap();
        assert_eq!(result["calls"], 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_handler_surfaces_exhaustion_and_fatal_errors() {
        let always = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            fail_times: u32::MAX,
            kind: ErrorKind::Timeout,
        });
        let err = RetryingHandler::new(always, engine())
            .handle(request())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.message.contains("gave up after 3 attempts"));

        let denied = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            fail_times: u32::MAX,
            kind: ErrorKind::Authorization,
        });
        let err = RetryingHandler::new(denied.clone(), engine())
            .handle(request())
            .await
            .unwrap_err();
        assert_eq!(err, HandlerError::new(ErrorKind::Authorization, "failure 1"));
        assert_eq!(denied.calls.load(Ordering::SeqCst), 1);

        let err = RetryingHandler::new(denied, engine())
            .with_service_class("cache")
            .handle(request())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn unavailable_handler_rejects() {
        let err = UnavailableHandler.handle(request()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
