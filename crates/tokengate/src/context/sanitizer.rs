//! Tool output masking and model fallback.
//!
//! Tool and console output is the largest context consumer in a coding
//! session: one test run or `grep` can inject tens of thousands of tokens,
//! and most of it is irrelevant once the model has seen it. The sanitizer
//! replaces any single tool message above a token threshold with a short
//! placeholder that references a [`MaskedHandle`]. The full output stays in
//! the [`HandleStore`], so masking is lossless.
//!
//! After masking, if the conversation still uses more than `fallback_ratio`
//! of the model's limit, the sanitizer looks for a larger model in the same
//! family and reports a [`FallbackDecision`]. The orchestrator then restarts
//! accounting against the new limit instead of redacting.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capabilities::HandleStore;
use crate::context::accountant::{ConversationCount, TokenAccountant, TokenBudget};
use crate::context::handles::MaskedHandle;
use crate::context::models::{ModelCatalog, ModelSpec};
use crate::error::Result;
use crate::pipeline::StageWarning;
use crate::{Message, MessageRole};

/// Prefix of every masking placeholder.
///
/// Both the placeholder writer and the "already masked?" check reference
/// this constant so they can't drift out of sync.
pub const MASKED_PREFIX: &str = "[Masked tool output:";

/// Configuration for the [`Sanitizer`].
#[derive(Debug, Clone)]
pub struct SanitizerConfig {
    /// Tool messages above this many tokens are masked.
    pub mask_threshold_tokens: usize,
    /// Characters of the original output kept inline in the placeholder.
    pub preview_chars: usize,
    /// Fraction of the model limit above which a fallback is requested.
    pub fallback_ratio: f64,
    /// Upper bound on a single handle store call.
    pub store_timeout: Duration,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            mask_threshold_tokens: 1000,
            preview_chars: 200,
            fallback_ratio: 0.90,
            store_timeout: Duration::from_secs(5),
        }
    }
}

impl SanitizerConfig {
    pub fn with_mask_threshold(mut self, tokens: usize) -> Self {
        self.mask_threshold_tokens = tokens;
        self
    }

    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }

    pub fn with_fallback_ratio(mut self, ratio: f64) -> Self {
        self.fallback_ratio = ratio;
        self
    }
}

/// Request to move the conversation to a larger model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackDecision {
    pub from_model: String,
    pub target_model: String,
    pub target_limit: usize,
}

/// Result of one sanitizer pass.
#[derive(Debug, Clone)]
pub struct SanitizerOutput {
    pub conversation: Vec<Message>,
    /// Counts for `conversation`, placeholders included.
    pub count: ConversationCount,
    /// Handles created during this pass, in conversation order.
    pub handles: Vec<MaskedHandle>,
    pub fallback: Option<FallbackDecision>,
    pub warnings: Vec<StageWarning>,
}

impl SanitizerOutput {
    pub fn masked(&self) -> usize {
        self.handles.len()
    }
}

/// Render the placeholder that replaces a masked message.
pub fn placeholder(handle: &MaskedHandle, tokens: usize) -> String {
    format!(
        "{MASKED_PREFIX} handle={} source={} tokens={}]\nPreview: {}",
        handle.hash_id, handle.source_tag, tokens, handle.preview
    )
}

/// Whether a message is already a masking placeholder.
pub fn is_masked(message: &Message) -> bool {
    message.content.starts_with(MASKED_PREFIX)
}

/// Masks oversized tool output and decides on model fallback.
#[derive(Clone)]
pub struct Sanitizer {
    accountant: TokenAccountant,
    store: Arc<dyn HandleStore>,
    config: SanitizerConfig,
}

impl Sanitizer {
    pub fn new(
        accountant: TokenAccountant,
        store: Arc<dyn HandleStore>,
        config: SanitizerConfig,
    ) -> Self {
        Self {
            accountant,
            store,
            config,
        }
    }

    pub fn config(&self) -> &SanitizerConfig {
        &self.config
    }

    /// Mask oversized tool messages, then check whether a fallback is due.
    ///
    /// `count` must describe `conversation`. Pass `catalog = None` to skip
    /// the fallback check (the orchestrator does this after it has already
    /// switched models once). Fails only when the tokenizer fails while
    /// counting a placeholder.
    pub async fn sanitize(
        &self,
        model: &ModelSpec,
        conversation: &[Message],
        count: &ConversationCount,
        budget: &TokenBudget,
        catalog: Option<&ModelCatalog>,
    ) -> Result<SanitizerOutput> {
        let mut out: Vec<Message> = conversation.to_vec();
        let mut count = count.clone();
        let mut handles = Vec::new();
        let mut warnings = Vec::new();

        for (index, message) in conversation.iter().enumerate() {
            if message.role != MessageRole::Tool || is_masked(message) {
                continue;
            }
            let tokens = count.tokens_at(index);
            if tokens <= self.config.mask_threshold_tokens {
                continue;
            }

            let source = message.tool_call_id.as_deref().unwrap_or("tool");
            let preview_chars = self.config.preview_chars;
            let handle = MaskedHandle::new(message.content.as_str(), source, preview_chars);

            let timeout = self.config.store_timeout;
            let stored = tokio::time::timeout(timeout, self.store.store(handle.clone())).await;
            let hash_id = match stored {
                Ok(Ok(id)) => id,
                Ok(Err(e)) => {
                    warn!("Handle store failed for message {index}, leaving it unmasked: {e}");
                    warnings.push(StageWarning::new(
                        "storage_failure",
                        format!("message {index}: {e}"),
                    ));
                    continue;
                }
                Err(_) => {
                    warn!("Handle store timed out for message {index}, leaving it unmasked");
                    warnings.push(StageWarning::new(
                        "storage_failure",
                        format!("message {index}: store timed out after {timeout:?}"),
                    ));
                    continue;
                }
            };

            let handle = MaskedHandle { hash_id, ..handle };
            let replacement = message.replaced_with(placeholder(&handle, tokens));
            let family = &model.family;
            let new_count = self.accountant.count_message(family, &replacement).await?;
            debug!(
                "Masked message {index} ({tokens} -> {} tokens) as {}",
                new_count.tokens, handle.hash_id
            );
            count.replace(index, new_count);
            out[index] = replacement;
            handles.push(handle);
        }

        let after = budget.with_usage(count.totals);
        let fallback = if after.exceeds_ratio(self.config.fallback_ratio) {
            catalog
                .and_then(|c| c.select_fallback(&model.name, after.used() + after.reserved))
                .map(|target| FallbackDecision {
                    from_model: model.name.clone(),
                    target_model: target.name.clone(),
                    target_limit: target.context_limit,
                })
        } else {
            None
        };

        if !handles.is_empty() || fallback.is_some() {
            info!(
                "Sanitizer masked {} message(s); {}{}",
                handles.len(),
                after.to_log_string(),
                fallback
                    .as_ref()
                    .map(|f| format!("; fallback to {}", f.target_model))
                    .unwrap_or_default(),
            );
        }

        Ok(SanitizerOutput {
            conversation: out,
            count,
            handles,
            fallback,
            warnings,
        })
    }
}
