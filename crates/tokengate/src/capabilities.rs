//! External capabilities consumed by the pipeline.
//!
//! The pipeline never tokenizes, summarizes, reranks or persists anything
//! itself. It calls out through the traits in this module, each of which is a
//! potential suspension point wrapped in a timeout by the caller:
//!
//! | Trait | Used by | Failure handling |
//! |-------|---------|------------------|
//! | [`TokenCounter`] | accountant | fatal (`TokenizerUnavailable`) |
//! | [`HandleStore`] | sanitizer | skip masking that message |
//! | [`Rerank`] | pruner (opt-in) | fall back to local scoring |
//! | [`Summarize`] | compactor | leave the conversation unchanged |
//!
//! All traits use boxed futures so they stay dyn-compatible and can be
//! injected as `Arc<dyn Trait>`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::handles::MaskedHandle;
use crate::error::CapabilityError;

/// Boxed future returned by every capability call.
pub type CapabilityFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CapabilityError>> + Send + 'a>>;

// ── Token counting ─────────────────────────────────────────────────

/// Exact token counter for one model family.
///
/// Implementations must use the destination model's real tokenizer.
/// Character or word approximations are not acceptable here: every
/// threshold decision downstream depends on these numbers.
pub trait TokenCounter: Send + Sync {
    /// Count the tokens in `text`.
    fn count<'a>(&'a self, text: &'a str) -> CapabilityFuture<'a, usize>;
}

/// A [`TokenCounter`] backed by a synchronous closure.
///
/// Convenient for in-process tokenizers that don't need to await anything:
///
/// ```ignore
/// let bpe = tiktoken_rs::o200k_base()?;
/// let counter = FnTokenCounter::new(move |text| bpe.encode_ordinary(text).len());
/// ```
pub struct FnTokenCounter<F>(F)
where
    F: Fn(&str) -> usize + Send + Sync;

impl<F> FnTokenCounter<F>
where
    F: Fn(&str) -> usize + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> TokenCounter for FnTokenCounter<F>
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn count<'a>(&'a self, text: &'a str) -> CapabilityFuture<'a, usize> {
        let n = (self.0)(text);
        Box::pin(async move { Ok(n) })
    }
}

/// Per-provider-family tokenizer lookup.
#[derive(Clone, Default)]
pub struct TokenizerRegistry {
    counters: HashMap<String, Arc<dyn TokenCounter>>,
}

impl TokenizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the counter for a model family (builder pattern).
    pub fn with(mut self, family: impl Into<String>, counter: Arc<dyn TokenCounter>) -> Self {
        self.counters.insert(family.into(), counter);
        self
    }

    /// Look up the counter for a family.
    pub fn get(&self, family: &str) -> Option<Arc<dyn TokenCounter>> {
        self.counters.get(family).cloned()
    }

    /// Registered family names, sorted.
    pub fn families(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.counters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for TokenizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerRegistry")
            .field("families", &self.families())
            .finish()
    }
}

// ── Summarization ──────────────────────────────────────────────────

/// Produces a condensed version of a block of conversation text.
pub trait Summarize: Send + Sync {
    /// Summarize `text` into at most `max_length` characters.
    fn summarize<'a>(&'a self, text: &'a str, max_length: usize) -> CapabilityFuture<'a, String>;
}

// ── Reranking ──────────────────────────────────────────────────────

/// Scores lines by relevance to a goal hint.
///
/// Must return exactly one score per input line, in input order. Any other
/// shape is treated as a malformed response.
pub trait Rerank: Send + Sync {
    fn rerank<'a>(&'a self, lines: &'a [String], goal_hint: &'a str)
    -> CapabilityFuture<'a, Vec<f32>>;

    /// Short name used in logs and health reports.
    fn name(&self) -> &str {
        "reranker"
    }
}

// ── Handle storage ─────────────────────────────────────────────────

/// Persistence for masked tool output.
///
/// Insert-once: storing a handle whose `hash_id` already exists keeps the
/// existing entry and returns its id. Eviction policy belongs to the
/// implementation.
pub trait HandleStore: Send + Sync {
    /// Persist a handle and return its `hash_id`.
    fn store(&self, handle: MaskedHandle) -> CapabilityFuture<'_, String>;

    /// Fetch a previously stored handle.
    fn fetch<'a>(&'a self, hash_id: &'a str) -> CapabilityFuture<'a, Option<MaskedHandle>>;
}
