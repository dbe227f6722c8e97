//! `TetherServer`: Axum HTTP + WebSocket server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::{AuthGate, Handshake, HeaderAuthGate};
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::router::EventRouter;
use crate::websocket::session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry.
    pub registry: Arc<ConnectionRegistry>,
    /// Event router.
    pub events: Arc<EventRouter>,
    /// Handshake authentication.
    pub auth: Arc<dyn AuthGate>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

/// The Tether server.
pub struct TetherServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    events: Arc<EventRouter>,
    auth: Arc<dyn AuthGate>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl TetherServer {
    /// Create a server routing through `events` (and its registry). Uses
    /// [`HeaderAuthGate`] until another gate is set.
    pub fn new(config: ServerConfig, events: Arc<EventRouter>) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::clone(events.registry()),
            events,
            auth: Arc::new(HeaderAuthGate),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Replace the authentication gate.
    #[must_use]
    pub fn with_auth_gate(mut self, auth: Arc<dyn AuthGate>) -> Self {
        self.auth = auth;
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: Arc::clone(&self.registry),
            events: Arc::clone(&self.events),
            auth: Arc::clone(&self.auth),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            config: Arc::clone(&self.config),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind and serve until the shutdown token fires.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        info!(%addr, "tether server listening");
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        });
        Ok((addr, handle))
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The event router.
    pub fn events(&self) -> &Arc<EventRouter> {
        &self.events
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.connection_count(),
        state.registry.identity_count(),
        state.registry.session_count(),
    ))
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let handshake = Handshake { headers, query };
    let ws = ws.max_message_size(state.config.max_message_size);

    match state.auth.authenticate(&handshake).await {
        Ok(principal) => ws
            .on_upgrade(move |socket| {
                state.shutdown.track_session(session::run_ws_session(
                    socket,
                    principal,
                    state.registry,
                    state.events,
                    state.config.outbound_buffer,
                    state.shutdown.token(),
                ))
            })
            .into_response(),
        Err(rejection) => ws
            .on_upgrade(move |socket| session::reject(socket, rejection))
            .into_response(),
    }
}
