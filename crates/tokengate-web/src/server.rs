//! Axum server setup and router construction.

use std::net::SocketAddr;

use axum::Router;
use axum::routing::{get, post};
use tokengate::telemetry::TelemetryHub;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::api;
use crate::ws;

/// Build the full axum router.
///
/// The router serves:
/// - WebSocket at `/ws`
/// - REST API at `/api/*`
pub fn build_router(hub: TelemetryHub) -> Router {
    // Dashboards usually run on a different port during development.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route("/api/events", post(api::post_event))
        .route("/api/health", get(api::get_health))
        .with_state(hub)
        .layer(cors)
}

/// Bind `bind_addr`, serve `router` on a background task and return the
/// bound address.
pub async fn start_server(router: Router, bind_addr: SocketAddr) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("Telemetry server stopped: {e}");
        }
    });

    Ok(addr)
}
