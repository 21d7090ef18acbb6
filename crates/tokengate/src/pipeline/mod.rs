//! The Budget Orchestrator and its event trail.
//!
//! - [`orchestrator`]: the state machine that sequences the stages.
//! - [`events`]: [`EventRecord`], [`StageWarning`] and the [`EventSink`]
//!   implementations.

pub mod events;
pub mod orchestrator;

pub use events::{
    CollectingSink, CompositeSink, EventRecord, EventSink, LoggingSink, NoopSink, Outcome, Stage,
    StageWarning,
};
pub use orchestrator::{
    MAX_FALLBACK_RESTARTS, Orchestrator, OrchestratorBuilder, PipelineOutcome, PipelineRequest,
    Signal, State, transition,
};
