//! WebSocket upgrade handler and message dispatch.
//!
//! Each connected client receives:
//! 1. A `subscribed` envelope with its subscriber id and how many queued
//!    events were replayed.
//! 2. Every event for its active session as the pipeline records it.
//!
//! Clients can send control messages back (`switch_session`, `ping`).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use tokengate::telemetry::{Envelope, Subscription, TelemetryHub};
use tracing::{debug, info};

/// Query parameters of `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Session to watch on a fresh subscription.
    pub session_id: Option<String>,
    /// Resume this subscriber instead of creating a new one.
    pub subscriber_id: Option<String>,
}

/// GET /ws: WebSocket upgrade handler.
///
/// A known `subscriber_id` resumes that subscriber. Otherwise a new one is
/// created for `session_id`; with neither usable the request is rejected
/// with 400.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(hub): State<TelemetryHub>,
) -> Response {
    let resumed = params
        .subscriber_id
        .as_deref()
        .and_then(|id| hub.reconnect(id));
    let subscription = match (resumed, params.session_id) {
        (Some(sub), _) => sub,
        (None, Some(session_id)) => hub.subscribe(&session_id),
        (None, None) => {
            return (
                StatusCode::BAD_REQUEST,
                "session_id is required unless resuming a known subscriber_id",
            )
                .into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, hub, subscription))
}

/// Drive a single WebSocket connection until either side goes away.
async fn handle_socket(socket: WebSocket, hub: TelemetryHub, mut subscription: Subscription) {
    let (mut sink, mut stream) = socket.split();
    let id = subscription.subscriber_id.clone();
    let generation = subscription.generation;
    info!(
        "Observer {id} connected to session {} ({} replayed)",
        subscription.session_id, subscription.replayed
    );

    let hello = Envelope::subscribed(&id, &subscription.session_id, subscription.replayed);
    if ws_send(&mut sink, &hello).await.is_ok() {
        loop {
            tokio::select! {
                envelope = subscription.recv() => match envelope {
                    Some(envelope) => {
                        if ws_send(&mut sink, &envelope).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = hub.handle_control(&id, text.as_str())
                            && ws_send(&mut sink, &reply).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {} // Binary, ping and pong frames carry no control.
                },
            }
        }
    }

    // A no-op when the subscriber was removed or a newer connection resumed it.
    if hub.disconnect(&id, generation) {
        debug!("Observer {id} disconnected; events will queue until it resumes");
    } else {
        debug!("Observer {id} connection closed by hub");
        let _ = sink.close().await;
    }
}

/// Serialize an envelope and send it over the WebSocket sink.
async fn ws_send(sink: &mut SplitSink<WebSocket, Message>, envelope: &Envelope) -> Result<(), ()> {
    let json = serde_json::to_string(envelope).map_err(|_| ())?;
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_optional() {
        let params: WsParams = serde_json::from_str("{}").unwrap();
        assert!(params.session_id.is_none());
        assert!(params.subscriber_id.is_none());

        let params: WsParams = serde_json::from_str(r#"{"session_id":"s-1"}"#).unwrap();
        assert_eq!(params.session_id.as_deref(), Some("s-1"));
    }
}
