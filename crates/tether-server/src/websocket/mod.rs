//! WebSocket connection registry, event routing, liveness and the per-socket
//! session loop.

pub mod connection;
pub mod events;
pub mod inbound;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;
