//! Settings types with compiled defaults.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::ErrorKind;

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Connection liveness and reaping.
    pub liveness: LivenessSettings,
    /// Retry policy overrides.
    pub retry: RetrySettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject values that would make the server unusable.
    pub fn validate(&self) -> Result<()> {
        if self.liveness.timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "liveness.timeoutMs must be positive".into(),
            ));
        }
        if self.liveness.reap_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "liveness.reapIntervalMs must be positive".into(),
            ));
        }
        if self.server.outbound_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "server.outboundBuffer must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Server network settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (`0` picks a free port).
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames queued per connection before sends start failing.
    pub outbound_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 16 * 1024 * 1024,
            outbound_buffer: 1024,
        }
    }
}

/// Liveness probing and stale-connection reaping.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LivenessSettings {
    /// A connection with no acknowledgment for this long is reaped.
    pub timeout_ms: u64,
    /// How often the reaper probes and sweeps.
    pub reap_interval_ms: u64,
}

impl LivenessSettings {
    /// Liveness timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reaper interval as a [`Duration`].
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            reap_interval_ms: 30_000,
        }
    }
}

/// Per-service-class retry policy overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// Keyed by service class (`llm`, `database`, `mcp`, `secret`, or new ones).
    pub policies: BTreeMap<String, PolicyOverride>,
}

/// Partial retry policy. Absent fields keep the built-in value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyOverride {
    /// Attempts including the first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    /// Cap on any single delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Growth factor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    /// Randomize delays.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
    /// Error kinds to retry; replaces the built-in set entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable_errors: Option<Vec<ErrorKind>>,
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
