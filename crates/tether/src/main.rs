//! Tether server entry point.
//!
//! Loads settings, builds the retry catalog and connection registry, then
//! serves `/ws` and `/health` until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tether_runtime::{PolicyCatalog, RetryPolicyEngine};
use tether_server::{
    ConnectionRegistry, EventRouter, RetryingHandler, ServerConfig, TetherServer,
    UnavailableHandler,
};
use tether_settings::TetherSettings;
use tracing::{info, warn};

/// Tether real-time fan-out server.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Tether WebSocket fan-out server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default: `~/.tether/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<TetherSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(tether_settings::settings_path);
        tether_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))
    }

    /// Settings with command-line flags applied on top.
    fn server_config(&self, settings: &TetherSettings) -> ServerConfig {
        let mut config = ServerConfig::from_settings(settings);
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    let level = cli.log_level.as_deref().unwrap_or(&settings.logging.level);
    tether_core::logging::init_subscriber(level, cli.json_logs || settings.logging.json);

    let catalog =
        PolicyCatalog::from_settings(&settings.retry).context("Invalid retry policy settings")?;
    let engine = Arc::new(RetryPolicyEngine::new(Arc::new(catalog)));
    info!(service_classes = ?engine.known_service_classes(), "retry policies loaded");

    let registry = Arc::new(ConnectionRegistry::new());
    let handler = RetryingHandler::new(Arc::new(UnavailableHandler), engine);
    let events = Arc::new(EventRouter::new(Arc::clone(&registry), Arc::new(handler)));

    let config = cli.server_config(&settings);
    let (reap_interval, liveness_timeout) = (config.reap_interval, config.liveness_timeout);
    let server = TetherServer::new(config, events);

    let (addr, serve) = server.listen().await.context("Failed to bind server")?;
    let reaper = registry.spawn_reaper(reap_interval, liveness_timeout, server.shutdown().token());
    info!(%addr, "tether ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutting down");

    if !server.shutdown().graceful_shutdown(vec![serve, reaper], None).await {
        warn!("forced shutdown");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["tether"]);
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(cli.settings.is_none());
        assert!(cli.log_level.is_none());
        assert!(!cli.json_logs);
    }

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from(["tether", "--host", "127.0.0.1", "--port", "9000"]);
        let config = cli.server_config(&TetherSettings::default());
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
        assert_eq!(config.liveness_timeout, Duration::from_secs(30));
    }

    #[test]
    fn settings_used_without_flags() {
        let cli = Cli::parse_from(["tether"]);
        let config = cli.server_config(&TetherSettings::default());
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn loads_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 7001}}"#).unwrap();

        let cli = Cli::parse_from(["tether", "--settings", path.to_str().unwrap()]);
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.server.port, 7001);
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    #[test]
    fn rejects_malformed_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let cli = Cli::parse_from(["tether", "--settings", path.to_str().unwrap()]);
        let err = cli.load_settings().unwrap_err();
        assert!(err.to_string().contains("Failed to load settings"));
    }
}
