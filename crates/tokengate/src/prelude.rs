//! Convenience re-exports for common `tokengate` types.
//!
//! Meant to be glob-imported by gateways embedding the pipeline:
//!
//! ```ignore
//! use tokengate::prelude::*;
//! ```
//!
//! Covers building an [`Orchestrator`], plugging in capabilities and
//! observing results. Pruner internals, RPC wire types and hub envelopes
//! are left out; import those from their modules directly.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{CapabilityError, Conversation, GateError, Message, MessageRole, index_conversation};

// ── Capabilities ────────────────────────────────────────────────────
pub use crate::capabilities::{
    CapabilityFuture, FnTokenCounter, HandleStore, Rerank, Summarize, TokenCounter,
    TokenizerRegistry,
};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::{GateConfig, OrchestratorConfig, RedactionConfig, Toggle};

// ── Context stages ──────────────────────────────────────────────────
pub use crate::context::{
    CompactorConfig, InMemoryHandleStore, ModelCatalog, ModelSpec, SanitizerConfig, TokenBudget,
};

// ── Redaction ───────────────────────────────────────────────────────
pub use crate::prune::{PruneOptions, PruneRequest, Pruner, PrunerConfig, Redactor, RemotePruner};

// ── Pipeline ────────────────────────────────────────────────────────
pub use crate::pipeline::{
    CollectingSink, CompositeSink, EventRecord, EventSink, LoggingSink, Orchestrator, Outcome,
    PipelineOutcome, PipelineRequest, Stage,
};

// ── Telemetry ───────────────────────────────────────────────────────
pub use crate::telemetry::{HubConfig, TelemetryHub};

// ── Remote LLMs ─────────────────────────────────────────────────────
pub use crate::api::LlmSummarizer;
