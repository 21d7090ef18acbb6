//! Standalone telemetry hub.
//!
//! Gateways publish pipeline events with `POST /api/events`; dashboards
//! watch a session over `/ws`. Hub sizing comes from `TOKENGATE_HUB_BACKLOG`
//! unless overridden on the command line.
//!
//! # Usage
//!
//! ```bash
//! tokengate-hub
//! tokengate-hub --port 8080 --backlog 1024
//! RUST_LOG=tokengate_web=debug tokengate-hub
//! ```
//!
//! Then watch a session:
//!
//! ```bash
//! websocat 'ws://127.0.0.1:3001/ws?session_id=my-session'
//! ```

use std::time::Duration;

use clap::Parser;
use tokengate::config::GateConfig;
use tokengate::telemetry::TelemetryHub;
use tokengate_web::{WebConfig, spawn_web};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Session-scoped telemetry fan-out for tokengate.
#[derive(Parser)]
#[command(
    name = "tokengate-hub",
    about = "WebSocket telemetry hub for the tokengate pipeline"
)]
struct Args {
    /// Interface to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: std::net::IpAddr,

    /// Port for the hub server.
    #[arg(long, default_value_t = 3001)]
    port: u16,

    /// Events queued per disconnected subscriber (overrides the environment).
    #[arg(long)]
    backlog: Option<usize>,

    /// Seconds a disconnected subscriber is kept before its backlog is dropped.
    #[arg(long, default_value_t = 600)]
    max_idle: u64,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut hub_config = GateConfig::from_env().hub;
    if let Some(backlog) = args.backlog {
        hub_config.backlog_capacity = backlog;
    }
    let hub = TelemetryHub::new(hub_config);

    let web_config = WebConfig {
        bind_addr: (args.host, args.port).into(),
        max_idle: Duration::from_secs(args.max_idle),
        ..Default::default()
    };
    let addr = spawn_web(hub, web_config)
        .await
        .map_err(|e| format!("failed to start hub on {}:{}: {e}", args.host, args.port))?;
    info!("tokengate-hub listening on http://{addr} (ws://{addr}/ws)");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to wait for shutdown signal: {e}"))?;
    info!("Shutting down");
    Ok(())
}
