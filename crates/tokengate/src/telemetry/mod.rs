//! Live fan-out of pipeline events to observers.
//!
//! The [`TelemetryHub`] is an [`EventSink`](crate::pipeline::EventSink):
//! hand a clone to the orchestrator and every [`EventRecord`](crate::pipeline::EventRecord)
//! is delivered, as an [`Envelope`], to the subscribers watching that
//! record's session. Transport (WebSocket, SSE) lives outside this crate;
//! see `tokengate-web`.

pub mod hub;

pub use hub::{ControlMessage, Envelope, HubConfig, HubStats, Subscription, TelemetryHub};
