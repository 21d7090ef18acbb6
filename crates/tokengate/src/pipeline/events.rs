//! Event records and sinks for the [`Orchestrator`](super::Orchestrator).
//!
//! Every stage invocation produces exactly one [`EventRecord`]. Records are
//! handed to an [`EventSink`] as soon as they're produced, in stage order,
//! and also returned in the run's outcome.
//!
//! | Sink | Use case |
//! |------|----------|
//! | [`NoopSink`] | Tests or fire-and-forget runs |
//! | [`LoggingSink`] | Structured logging via `tracing` |
//! | [`CollectingSink`] | Capture records in memory (tests, batch export) |
//! | [`CompositeSink`] | Fan out to several sinks in order |
//! | [`TelemetryHub`](crate::telemetry::TelemetryHub) | Live observers over WebSocket |

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::GateError;

/// Pipeline stage that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Account,
    Sanitize,
    /// Switch to a larger model.
    Fallback,
    Redact,
    Compact,
    /// Final verdict of the run.
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Account => "account",
            Stage::Sanitize => "sanitize",
            Stage::Fallback => "fallback",
            Stage::Redact => "redact",
            Stage::Compact => "compact",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// What a stage did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The conversation fits the budget.
    Fits,
    /// The conversation exceeds the budget.
    OverBudget,
    /// The stage reduced the conversation.
    Reduced,
    /// The stage ran and changed nothing.
    Unchanged,
    /// The stage hit a recoverable failure; see the warnings.
    Degraded,
    /// The stage did not run (not configured or below its trigger).
    Skipped,
    /// A larger model was selected.
    FallbackRequested,
}

/// A recoverable problem reported by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageWarning {
    /// Stable snake_case code, e.g. `storage_failure`.
    pub code: String,
    pub message: String,
}

impl StageWarning {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn from_error(error: &GateError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

/// One record per stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub stage: Stage,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub outcome: Outcome,
    /// Model the stage ran against.
    pub model: String,
    pub limit: usize,
    pub reserved: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<StageWarning>,
    /// Stage-specific payload (handle ids, prune ids, fallback target).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl EventRecord {
    /// Envelope `type` used on the telemetry stream.
    pub fn event_type(&self) -> &'static str {
        match (self.stage, self.outcome) {
            (Stage::Account, _) => "budget_event",
            (Stage::Sanitize, _) => "masking_event",
            (Stage::Fallback, _) => "fallback_event",
            (Stage::Redact, _) => "redaction_event",
            (Stage::Compact, _) => "compaction_event",
            (Stage::Done, Outcome::OverBudget) => "over_budget_event",
            (Stage::Done, _) => "budget_event",
        }
    }

    pub fn tokens_saved(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }
}

// ── Sinks ──────────────────────────────────────────────────────────

/// Receives event records as the orchestrator produces them.
///
/// Called synchronously on the request path, so implementations should
/// hand off rather than block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EventRecord);
}

/// Discards every event.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &EventRecord) {}
}

/// Logs every event through `tracing`.
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn emit(&self, event: &EventRecord) {
        let codes: Vec<&str> = event.warnings.iter().map(|w| w.code.as_str()).collect();
        match event.outcome {
            Outcome::Degraded | Outcome::OverBudget => warn!(
                "[{}] {} {:?}: {} -> {} tokens (limit {}, reserved {}) warnings={:?}",
                event.session_id,
                event.stage,
                event.outcome,
                event.tokens_before,
                event.tokens_after,
                event.limit,
                event.reserved,
                codes,
            ),
            _ => info!(
                "[{}] {} {:?}: {} -> {} tokens (limit {}, reserved {})",
                event.session_id,
                event.stage,
                event.outcome,
                event.tokens_before,
                event.tokens_after,
                event.limit,
                event.reserved,
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<EventRecord>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &EventRecord) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Forwards each event to several sinks in registration order.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to the chain.
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Conditionally add a sink to the chain.
    pub fn with_if(self, condition: bool, sink: Arc<dyn EventSink>) -> Self {
        if condition { self.with(sink) } else { self }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for CompositeSink {
    fn emit(&self, event: &EventRecord) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(stage: Stage, outcome: Outcome) -> EventRecord {
        EventRecord {
            stage,
            session_id: "s1".into(),
            timestamp: Utc::now(),
            tokens_before: 100,
            tokens_after: 60,
            outcome,
            model: "m".into(),
            limit: 80,
            reserved: 0,
            warnings: vec![],
            detail: serde_json::Value::Null,
        }
    }

    #[test]
    fn event_types_follow_stage() {
        let cases = [
            (Stage::Sanitize, Outcome::Reduced, "masking_event"),
            (Stage::Redact, Outcome::Reduced, "redaction_event"),
            (Stage::Compact, Outcome::Reduced, "compaction_event"),
            (Stage::Done, Outcome::OverBudget, "over_budget_event"),
            (Stage::Done, Outcome::Fits, "budget_event"),
        ];
        for (stage, outcome, expected) in cases {
            assert_eq!(event(stage, outcome).event_type(), expected);
        }
        let fallback = event(Stage::Fallback, Outcome::FallbackRequested);
        assert_eq!(fallback.event_type(), "fallback_event");
    }

    #[test]
    fn event_serializes_snake_case() {
        let json = serde_json::to_value(event(Stage::Done, Outcome::OverBudget)).unwrap();
        assert_eq!(json["stage"], "done");
        assert_eq!(json["outcome"], "over_budget");
        assert!(json.get("warnings").is_none());
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn composite_forwards_in_order() {
        let a = Arc::new(CollectingSink::new());
        let b = Arc::new(CollectingSink::new());
        let sink = CompositeSink::new()
            .with(a.clone())
            .with(Arc::new(LoggingSink))
            .with_if(false, Arc::new(NoopSink))
            .with(b.clone());
        assert_eq!(sink.len(), 3);
        sink.emit(&event(Stage::Account, Outcome::OverBudget));
        sink.emit(&event(Stage::Sanitize, Outcome::Reduced));
        assert_eq!(a.events().len(), 2);
        assert_eq!(b.events()[1].stage, Stage::Sanitize);
    }

    #[test]
    fn warning_from_error_uses_code() {
        let w = StageWarning::from_error(&GateError::StorageFailure("disk".into()));
        assert_eq!(w.code, "storage_failure");
        assert_eq!(event(Stage::Compact, Outcome::Reduced).tokens_saved(), 40);
    }
}
