//! Context budget enforcement for LLM gateways.
//!
//! `tokengate` sits between a development client and one or more upstream
//! model providers. On every outgoing request it makes sure the conversation
//! fits the target model's context window while throwing away as little as
//! possible, and it reports what it did to any number of live observers.
//!
//! The core abstraction is the [`Orchestrator`](pipeline::Orchestrator): a
//! deterministic state machine that runs four stages in order of increasing
//! destructiveness, stopping as soon as the conversation fits:
//!
//! 1. **Account**: exact, per-message token counting split into memory,
//!    tool and chat sub-totals ([`context::accountant`]).
//! 2. **Sanitize**: oversized tool output is masked behind a retrievable
//!    handle, and a larger model from the same provider family is requested
//!    when masking alone isn't enough ([`context::sanitizer`]).
//! 3. **Redact**: line-level, annotated, recoverable pruning of the
//!    remaining oversized messages ([`prune`]).
//! 4. **Compact**: the middle of the conversation is summarized while system
//!    messages and the most recent exchanges stay verbatim
//!    ([`context::compactor`]).
//!
//! Every stage invocation produces an [`EventRecord`](pipeline::EventRecord),
//! fanned out per session by the [`TelemetryHub`](telemetry::TelemetryHub).
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokengate::prelude::*;
//!
//! let registry = TokenizerRegistry::new().with("anthropic", Arc::new(MyTokenizer));
//! let hub = TelemetryHub::new(HubConfig::default());
//!
//! let orchestrator = Orchestrator::builder(GateConfig::from_env())
//!     .tokenizers(Arc::new(registry))
//!     .handle_store(Arc::new(InMemoryHandleStore::default()))
//!     .redactor(Arc::new(Pruner::new(PrunerConfig::default())))
//!     .summarizer(Arc::new(my_summarizer))
//!     .catalog(ModelCatalog::builtin())
//!     .sink(Arc::new(hub.clone()))
//!     .build();
//!
//! let outcome = orchestrator
//!     .run(PipelineRequest::new("session-1", "claude-sonnet-4", messages))
//!     .await?;
//!
//! forward_upstream(&outcome.model, &outcome.conversation).await;
//! ```
//!
//! # Where to find things
//!
//! - **Plug in a tokenizer, summarizer, reranker or handle store:** see the
//!   traits in [`capabilities`].
//! - **Tune thresholds:** see [`GateConfig`](config::GateConfig) and
//!   [`GateConfig::from_env()`](config::GateConfig::from_env).
//! - **Run the pruner as a standalone service:** see [`prune::rpc`] and the
//!   `tokengate-pruner` binary.
//! - **Observe the pipeline:** subscribe to a
//!   [`TelemetryHub`](telemetry::TelemetryHub), or implement
//!   [`EventSink`](pipeline::EventSink).

pub mod api;
pub mod capabilities;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod prelude;
pub mod prune;
pub mod telemetry;

use serde::{Deserialize, Serialize};

pub use error::{CapabilityError, GateError, Result};

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    /// Tool results and console output.
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the conversation.
///
/// Messages are treated as immutable once counted: reduction stages build
/// replacement messages with [`Message::replaced_with`] instead of editing
/// content in place, so the original is always available for comparison.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Position of the message in the conversation as received from the client.
    #[serde(default)]
    pub sequence_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }

    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            sequence_index: 0,
            tool_call_id: None,
        }
    }

    /// Build a replacement for this message carrying new content.
    ///
    /// Role, sequence index and tool call id are preserved so the replacement
    /// occupies the same slot in the conversation.
    pub fn replaced_with(&self, content: impl Into<String>) -> Self {
        Self {
            role: self.role,
            content: content.into(),
            sequence_index: self.sequence_index,
            tool_call_id: self.tool_call_id.clone(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == MessageRole::System
    }
}

/// An ordered conversation. Order is significant: stages trim or replace
/// messages in place but never reorder them.
pub type Conversation = Vec<Message>;

/// Assign `sequence_index` values matching each message's current position.
pub fn index_conversation(messages: impl IntoIterator<Item = Message>) -> Conversation {
    messages
        .into_iter()
        .enumerate()
        .map(|(i, mut m)| {
            m.sequence_index = i;
            m
        })
        .collect()
}

/// Truncate `text` to at most `max_chars` characters, appending `…` when cut.
///
/// Character-based, so it never splits a UTF-8 sequence. Used for previews
/// only; budget decisions always go through a [`TokenCounter`](capabilities::TokenCounter).
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}
