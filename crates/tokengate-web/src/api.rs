//! REST endpoint handlers.
//!
//! These complement the WebSocket channel for producers that would rather
//! not hold a connection open (a gateway in another process) and for health
//! checks.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use tokengate::pipeline::EventRecord;
use tokengate::telemetry::{HubStats, TelemetryHub};
use tracing::debug;

/// Response body for POST /api/events.
#[derive(Debug, Serialize)]
pub struct PublishReply {
    /// Subscribers the event was sent to immediately.
    pub delivered: usize,
}

/// POST /api/events: publish one event record to its session's observers.
///
/// Returns 202 with the number of immediate deliveries. Malformed bodies are
/// rejected by the `Json` extractor before reaching the hub.
pub async fn post_event(
    State(hub): State<TelemetryHub>,
    Json(event): Json<EventRecord>,
) -> (StatusCode, Json<PublishReply>) {
    debug!(
        "Publishing {} for session {} over HTTP",
        event.event_type(),
        event.session_id
    );
    let delivered = hub.publish(&event);
    (StatusCode::ACCEPTED, Json(PublishReply { delivered }))
}

/// GET /api/health: hub counters.
pub async fn get_health(State(hub): State<TelemetryHub>) -> Json<HubStats> {
    Json(hub.stats())
}
