//! # blpgw-gateway
//!
//! Gateway binary: loads settings, installs logging and metrics, and serves
//! the HTTP/WebSocket adapters over a simulated upstream session.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use blpgw_core::constants::{NAME, VERSION};
use blpgw_server::shutdown::DEFAULT_DRAIN_TIMEOUT;
use blpgw_server::{GatewayServer, ServerConfig, SimulatedFactory};
use blpgw_settings::GatewaySettings;
use clap::Parser;
use tracing::{info, warn};

/// Market-data gateway server.
#[derive(Parser, Debug)]
#[command(name = "blpgw", about = "Market-data gateway server")]
struct Cli {
    /// Settings file (defaults to `~/.blpgw/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log level or filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit one JSON object per log line.
    #[arg(long)]
    json_logs: bool,
}

/// Load settings from the chosen file and layer the CLI flags on top.
fn resolve_settings(cli: &Cli) -> Result<GatewaySettings> {
    let mut settings = match &cli.config {
        Some(path) => blpgw_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => blpgw_settings::load_settings().context("Failed to load settings")?,
    };
    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = resolve_settings(&args)?;

    if args.json_logs {
        blpgw_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        blpgw_core::logging::init_subscriber(&settings.logging.level);
    }
    info!(name = NAME, version = VERSION, "starting");

    let metrics = match blpgw_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let factory = SimulatedFactory::ticking(
        Duration::from_millis(settings.upstream.tick_interval_ms),
        settings.upstream.partial_responses,
    );
    let server = GatewayServer::new(ServerConfig::from(&settings), Arc::new(factory), metrics);

    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;
    info!(%addr, "gateway ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("shutting down");
    let _ = server.shutdown().drain(handle, DEFAULT_DRAIN_TIMEOUT).await;
    server.provider().stop().await;
    info!("Shutdown complete");
    Ok(())
}
