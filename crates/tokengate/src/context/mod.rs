//! Conversation-level budget stages: accounting, masking, and compaction.
//!
//! The stages here operate on whole messages. Line-level redaction lives in
//! [`crate::prune`] because it can also run as a separate service.
//!
//! 1. **[`accountant`]**: exact per-message token counts split into memory,
//!    tool and chat sub-totals, and the [`TokenBudget`] those counts fill.
//!
//! 2. **[`sanitizer`]**: replaces oversized tool output with a placeholder
//!    that references a retrievable [`MaskedHandle`](handles::MaskedHandle),
//!    then asks for a larger model from the same family if masking alone
//!    isn't enough ([`models`]).
//!
//! 3. **[`compactor`]**: summarizes the middle of the conversation while
//!    system messages and the last few exchanges stay verbatim. Last resort.

pub mod accountant;
pub mod compactor;
pub mod handles;
pub mod markers;
pub mod models;
pub mod sanitizer;

pub use accountant::{
    AccountantConfig, CategoryTotals, ConversationCount, MessageCount, TokenAccountant,
    TokenBudget, TokenCategory,
};
pub use compactor::{CompactionResult, Compactor, CompactorConfig};
pub use handles::{InMemoryHandleStore, MaskedHandle};
pub use markers::MemoryMarkerKind;
pub use models::{ModelCatalog, ModelSpec};
pub use sanitizer::{FallbackDecision, Sanitizer, SanitizerConfig, SanitizerOutput};
