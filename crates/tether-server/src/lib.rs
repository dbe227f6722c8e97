//! # tether-server
//!
//! Axum HTTP + `WebSocket` server around the connection registry.
//!
//! - `WebSocket` gateway: authentication, connection registry, liveness reaping
//! - Typed event fan-out by identity, session, topic or to everyone
//! - Inbound dispatch with replies and an application handler seam
//! - `/health` endpoint
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use auth::{AuthGate, AuthRejection, Handshake, HeaderAuthGate, Principal};
pub use config::ServerConfig;
pub use server::TetherServer;
pub use shutdown::ShutdownCoordinator;
pub use websocket::events::{EventType, OutboundEvent};
pub use websocket::registry::{ConnectionRegistry, RegistryError, Target};
pub use websocket::router::{
    ApplicationHandler, EventRouter, ForwardedRequest, HandlerError, HandlerRequest, RequestKind,
    RetryingHandler, UnavailableHandler,
};
pub use websocket::transport::{ChannelTransport, Transport, TransportError};
