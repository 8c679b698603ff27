mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::Level;
use varsync_engine::{Backend, WrapperRegistry};
use varsync_server::ServerConfig;
use varsync_telemetry::{init_telemetry, TelemetryConfig};

use crate::demo::DemoBackend;

#[derive(Debug, Parser)]
#[command(name = "varsync", about = "Variable synchronization server")]
struct Args {
    /// JSON file with base server settings; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Local socket serving both the packet and the text protocol.
    #[arg(long, conflicts_with = "no_socket")]
    socket: Option<PathBuf>,

    /// Serve TCP only.
    #[arg(long)]
    no_socket: bool,

    /// Start every session with the built-in demo backend.
    #[arg(long)]
    demo: bool,

    /// Demo counter tick in milliseconds.
    #[arg(long, default_value_t = 1000)]
    demo_tick_ms: u64,

    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty: bool,

    /// Persist warnings and errors to SQLite.
    #[arg(long)]
    log_db: Option<PathBuf>,
}

impl Args {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
            }
            None => ServerConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(socket) = &self.socket {
            config.socket_path = Some(socket.clone());
        }
        if self.no_socket {
            config.socket_path = None;
        }
        Ok(config)
    }

    fn telemetry(&self) -> TelemetryConfig {
        let mut telemetry = TelemetryConfig {
            log_level: self.log_level,
            json: !self.pretty,
            ..TelemetryConfig::default()
        };
        if let Some(path) = &self.log_db {
            telemetry.log_to_sqlite = true;
            telemetry.log_db_path = path.clone();
        }
        telemetry
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _telemetry = init_telemetry(args.telemetry());
    let config = args.server_config()?;

    let backend: Option<Arc<dyn Backend>> = args
        .demo
        .then(|| Arc::new(DemoBackend::new(Duration::from_millis(args.demo_tick_ms))) as Arc<dyn Backend>);
    if let Some(backend) = &backend {
        tracing::info!(backend = backend.name(), "embedded backend installed");
    }

    let handle = varsync_server::start(config, Arc::new(WrapperRegistry::new()), backend)
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, socket = ?handle.socket_path, "varsync ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl+c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from(["varsync", "--port", "9000", "--no-socket", "--demo"]);
        let config = args.server_config().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.socket_path, None);
        assert_eq!(config.host, "127.0.0.1");
        assert!(args.demo);
    }

    #[test]
    fn config_file_supplies_base_values() {
        let path = std::env::temp_dir().join(format!("varsync-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"port": 7000, "client_debounce_ms": 5}"#).unwrap();
        let args = Args::parse_from(["varsync", "--config", path.to_str().unwrap(), "--host", "0.0.0.0"]);
        let config = args.server_config().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.client_debounce_ms, 5);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_poll_wait_ms, 30_000);
    }

    #[test]
    fn telemetry_flags() {
        let args = Args::parse_from(["varsync", "--pretty", "--log-level", "debug", "--log-db", "/tmp/x.db"]);
        let telemetry = args.telemetry();
        assert!(!telemetry.json);
        assert_eq!(telemetry.log_level, Level::DEBUG);
        assert!(telemetry.log_to_sqlite);
    }
}
