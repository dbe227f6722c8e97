//! Server configuration.

use std::time::Duration;

use tether_settings::TetherSettings;

/// Runtime configuration for [`TetherServer`](crate::server::TetherServer).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue capacity, in frames.
    pub outbound_buffer: usize,
    /// Age after which a connection without a liveness ack is reaped.
    pub liveness_timeout: Duration,
    /// Interval between reaper passes.
    pub reap_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            outbound_buffer: 1024,
            liveness_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &TetherSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
            outbound_buffer: settings.server.outbound_buffer,
            liveness_timeout: settings.liveness.timeout(),
            reap_interval: settings.liveness.reap_interval(),
        }
    }

    /// `host:port`
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
