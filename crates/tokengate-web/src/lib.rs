//! WebSocket telemetry server for the `tokengate` budget pipeline.
//!
//! `tokengate-web` exposes a [`TelemetryHub`] to browsers and other
//! observers. Each WebSocket connection watches one session and receives
//! every pipeline event recorded for it, in order.
//!
//! # Quick start
//!
//! ```ignore
//! use tokengate::telemetry::{HubConfig, TelemetryHub};
//! use tokengate_web::{WebConfig, spawn_web};
//!
//! let hub = TelemetryHub::new(HubConfig::default());
//! let addr = spawn_web(hub.clone(), WebConfig::default()).await?;
//! println!("Telemetry: ws://{addr}/ws?session_id=...");
//!
//! // Hand the same hub to the orchestrator as its event sink.
//! let orchestrator = Orchestrator::builder(config).sink(Arc::new(hub)).build();
//! ```
//!
//! # Endpoints
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /ws?session_id=..` | subscribe to a session |
//! | `GET /ws?subscriber_id=..` | resume a subscription, replaying queued events |
//! | `POST /api/events` | publish an [`EventRecord`](tokengate::pipeline::EventRecord) |
//! | `GET /api/health` | hub counters |
//!
//! The first message on every connection is a `subscribed` envelope
//! carrying the subscriber id to resume with. Clients may send
//! `{"type":"switch_session","session_id":".."}` and `{"type":"ping"}`.

mod api;
mod server;
mod ws;

pub use server::{build_router, start_server};

use std::net::SocketAddr;
use std::time::Duration;

use tokengate::telemetry::TelemetryHub;
use tracing::debug;

/// Configuration for the web server.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// Address to bind to. Default: `127.0.0.1:3001`.
    pub bind_addr: SocketAddr,
    /// Disconnected subscribers idle longer than this are dropped along
    /// with their backlog. Default: 10 minutes.
    pub max_idle: Duration,
    /// How often idle subscribers are swept. Default: 30 seconds.
    pub reap_interval: Duration,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            max_idle: Duration::from_secs(600),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Spawn the web server and the idle-subscriber sweeper on Tokio tasks.
///
/// Returns the bound address. Both tasks run until the runtime shuts down.
pub async fn spawn_web(hub: TelemetryHub, config: WebConfig) -> std::io::Result<SocketAddr> {
    let router = build_router(hub.clone());
    let addr = start_server(router, config.bind_addr).await?;

    let interval = config.reap_interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reaped = hub.reap_disconnected(config.max_idle);
            if reaped > 0 {
                debug!("Swept {reaped} idle subscriber(s)");
            }
        }
    });

    Ok(addr)
}
