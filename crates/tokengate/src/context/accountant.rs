//! Token accounting: exact per-message counts and the running budget.
//!
//! The accountant is a pure function over a conversation snapshot. It asks
//! the model family's [`TokenCounter`] for every message and splits the
//! totals into three categories:
//!
//! - **memory**: messages carrying a long-term memory marker
//!   (see [`markers`](super::markers)), regardless of role;
//! - **tool**: tool and console output;
//! - **chat**: everything else, system prompts included.
//!
//! There is deliberately no character-based fallback. If the family has no
//! registered tokenizer, or the tokenizer fails or times out, counting fails
//! with [`GateError::TokenizerUnavailable`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::capabilities::{TokenCounter, TokenizerRegistry};
use crate::context::markers;
use crate::error::{GateError, Result};
use crate::{Message, MessageRole};

/// Default upper bound on a full-conversation count.
pub const DEFAULT_COUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the [`TokenAccountant`].
#[derive(Debug, Clone)]
pub struct AccountantConfig {
    /// Maximum time a single counting pass may take.
    pub count_timeout: Duration,
}

impl Default for AccountantConfig {
    fn default() -> Self {
        Self {
            count_timeout: DEFAULT_COUNT_TIMEOUT,
        }
    }
}

/// Budget category a message is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenCategory {
    Memory,
    Tool,
    Chat,
}

/// Classify a message into its budget category.
pub fn categorize(message: &Message) -> TokenCategory {
    if markers::detect(&message.content).is_some() {
        TokenCategory::Memory
    } else if message.role == MessageRole::Tool {
        TokenCategory::Tool
    } else {
        TokenCategory::Chat
    }
}

/// Token totals split by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotals {
    pub memory: usize,
    pub tool: usize,
    pub chat: usize,
}

impl CategoryTotals {
    pub fn total(&self) -> usize {
        self.memory + self.tool + self.chat
    }

    fn slot(&mut self, category: TokenCategory) -> &mut usize {
        match category {
            TokenCategory::Memory => &mut self.memory,
            TokenCategory::Tool => &mut self.tool,
            TokenCategory::Chat => &mut self.chat,
        }
    }

    fn add(&mut self, category: TokenCategory, tokens: usize) {
        *self.slot(category) += tokens;
    }

    fn sub(&mut self, category: TokenCategory, tokens: usize) {
        let slot = self.slot(category);
        *slot = slot.saturating_sub(tokens);
    }
}

/// Exact count for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCount {
    pub tokens: usize,
    pub category: TokenCategory,
}

/// Exact counts for a whole conversation.
///
/// `per_message[i]` always describes `conversation[i]`. Stages that replace a
/// single message call [`replace`](Self::replace) with the new message's count
/// instead of recounting everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationCount {
    pub per_message: Vec<MessageCount>,
    pub totals: CategoryTotals,
}

impl ConversationCount {
    pub fn total(&self) -> usize {
        self.totals.total()
    }

    /// Tokens for message `index` (0 when out of range).
    pub fn tokens_at(&self, index: usize) -> usize {
        self.per_message.get(index).map_or(0, |c| c.tokens)
    }

    /// Swap the count for message `index`, keeping totals consistent.
    pub fn replace(&mut self, index: usize, count: MessageCount) {
        if let Some(slot) = self.per_message.get_mut(index) {
            self.totals.sub(slot.category, slot.tokens);
            self.totals.add(count.category, count.tokens);
            *slot = count;
        }
    }

    /// Rebuild `totals` from `per_message`.
    pub fn recompute_totals(&mut self) {
        let mut totals = CategoryTotals::default();
        for c in &self.per_message {
            totals.add(c.category, c.tokens);
        }
        self.totals = totals;
    }

    fn push(&mut self, count: MessageCount) {
        self.totals.add(count.category, count.tokens);
        self.per_message.push(count);
    }
}

/// Token budget for one orchestrator run.
///
/// The invariant the pipeline restores is `used <= limit - reserved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    /// Context window of the target model.
    pub limit: usize,
    /// Margin held back for the model's response.
    pub reserved: usize,
    pub used_by_category: CategoryTotals,
}

impl TokenBudget {
    pub fn new(limit: usize, reserved: usize) -> Self {
        Self {
            limit,
            reserved,
            used_by_category: CategoryTotals::default(),
        }
    }

    /// Copy of this budget with updated usage.
    pub fn with_usage(&self, used_by_category: CategoryTotals) -> Self {
        Self {
            used_by_category,
            ..self.clone()
        }
    }

    /// Copy of this budget against a different model limit.
    pub fn with_limit(&self, limit: usize) -> Self {
        Self {
            limit,
            ..self.clone()
        }
    }

    pub fn used(&self) -> usize {
        self.used_by_category.total()
    }

    /// Tokens the conversation may occupy: `limit - reserved`.
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.reserved)
    }

    /// Whether the conversation currently fits.
    pub fn fits(&self) -> bool {
        self.used() <= self.available()
    }

    /// Tokens that still have to go for the conversation to fit.
    pub fn overage(&self) -> usize {
        self.used().saturating_sub(self.available())
    }

    /// Whether `used > limit * ratio`.
    pub fn exceeds_ratio(&self, ratio: f64) -> bool {
        self.used() as f64 > self.limit as f64 * ratio
    }

    /// Usage as a fraction of the raw limit (0.0 to 1.0+).
    pub fn usage_pct(&self) -> f64 {
        if self.limit == 0 {
            1.0
        } else {
            self.used() as f64 / self.limit as f64
        }
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "budget: {} tokens ({:.0}% of {}, {} reserved; memory={} tool={} chat={})",
            self.used(),
            self.usage_pct() * 100.0,
            self.limit,
            self.reserved,
            self.used_by_category.memory,
            self.used_by_category.tool,
            self.used_by_category.chat,
        )
    }
}

/// Exact token counting against a per-family tokenizer registry.
#[derive(Debug, Clone)]
pub struct TokenAccountant {
    registry: Arc<TokenizerRegistry>,
    config: AccountantConfig,
}

impl TokenAccountant {
    pub fn new(registry: Arc<TokenizerRegistry>, config: AccountantConfig) -> Self {
        Self { registry, config }
    }

    fn counter_for(&self, family: &str) -> Result<Arc<dyn TokenCounter>> {
        self.registry
            .get(family)
            .ok_or_else(|| GateError::TokenizerUnavailable {
                family: family.to_string(),
                reason: "no tokenizer registered".into(),
            })
    }

    /// Count a single piece of text.
    pub async fn count_text(&self, family: &str, text: &str) -> Result<usize> {
        let counter = self.counter_for(family)?;
        self.bounded(family, async { count_with(&*counter, family, text).await })
            .await
    }

    /// Count a single message and classify it.
    pub async fn count_message(&self, family: &str, message: &Message) -> Result<MessageCount> {
        let tokens = self.count_text(family, &message.content).await?;
        Ok(MessageCount {
            tokens,
            category: categorize(message),
        })
    }

    /// Count every message in `conversation`.
    ///
    /// Pure over the snapshot: counting the same conversation twice yields
    /// identical results.
    pub async fn count(&self, family: &str, conversation: &[Message]) -> Result<ConversationCount> {
        let counter = self.counter_for(family)?;
        let count = self
            .bounded(family, async {
                let mut count = ConversationCount::default();
                for message in conversation {
                    let tokens = count_with(&*counter, family, &message.content).await?;
                    count.push(MessageCount {
                        tokens,
                        category: categorize(message),
                    });
                }
                Ok(count)
            })
            .await?;
        debug!(
            "Counted {} message(s) for {family}: memory={} tool={} chat={}",
            conversation.len(),
            count.totals.memory,
            count.totals.tool,
            count.totals.chat,
        );
        Ok(count)
    }

    async fn bounded<T>(
        &self,
        family: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.count_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GateError::TokenizerUnavailable {
                family: family.to_string(),
                reason: format!("counting timed out after {:?}", self.config.count_timeout),
            }),
        }
    }
}

async fn count_with(counter: &dyn TokenCounter, family: &str, text: &str) -> Result<usize> {
    let tokens = counter
        .count(text)
        .await
        .map_err(|e| GateError::TokenizerUnavailable {
            family: family.to_string(),
            reason: e.to_string(),
        })?;
    trace!("{tokens} tokens for {} chars", text.len());
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilityFuture, FnTokenCounter};
    use crate::error::CapabilityError;

    fn word_registry() -> Arc<TokenizerRegistry> {
        Arc::new(TokenizerRegistry::new().with(
            "test",
            Arc::new(FnTokenCounter::new(|t: &str| t.split_whitespace().count())),
        ))
    }

    fn accountant() -> TokenAccountant {
        TokenAccountant::new(word_registry(), AccountantConfig::default())
    }

    struct BrokenCounter;
    impl TokenCounter for BrokenCounter {
        fn count<'a>(&'a self, _text: &'a str) -> CapabilityFuture<'a, usize> {
            Box::pin(async { Err(CapabilityError::Unavailable("model files missing".into())) })
        }
    }

    struct SlowCounter;
    impl TokenCounter for SlowCounter {
        fn count<'a>(&'a self, _text: &'a str) -> CapabilityFuture<'a, usize> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            })
        }
    }

    #[tokio::test]
    async fn splits_counts_by_category() {
        let conversation = vec![
            Message::system("you are helpful"),
            Message::user("<memory>likes rust</memory> hi"),
            Message::tool_result("c1", "a b c d e"),
            Message::assistant("ok then"),
        ];
        let count = accountant().count("test", &conversation).await.unwrap();
        assert_eq!(count.totals.chat, 3 + 2);
        assert_eq!(count.totals.memory, 3);
        assert_eq!(count.totals.tool, 5);
        assert_eq!(count.per_message.len(), 4);
        assert_eq!(count.per_message[2].category, TokenCategory::Tool);
    }

    #[tokio::test]
    async fn counting_is_idempotent() {
        let conversation = vec![Message::user("one two"), Message::tool_result("c", "x y z")];
        let acc = accountant();
        let first = acc.count("test", &conversation).await.unwrap();
        let second = acc.count("test", &conversation).await.unwrap();
        assert_eq!(first, second);
        let budget = TokenBudget::new(100, 10);
        assert_eq!(
            budget.with_usage(first.totals),
            budget.with_usage(second.totals)
        );
    }

    #[tokio::test]
    async fn unknown_family_fails_loudly() {
        let err = accountant()
            .count("mystery", &[Message::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::TokenizerUnavailable { .. }));
    }

    #[tokio::test]
    async fn counter_failure_is_tokenizer_unavailable() {
        let registry = Arc::new(TokenizerRegistry::new().with("x", Arc::new(BrokenCounter)));
        let acc = TokenAccountant::new(registry, AccountantConfig::default());
        let err = acc.count_text("x", "hello").await.unwrap_err();
        assert_eq!(err.code(), "tokenizer_unavailable");
    }

    #[tokio::test]
    async fn slow_counter_times_out() {
        let registry = Arc::new(TokenizerRegistry::new().with("x", Arc::new(SlowCounter)));
        let acc = TokenAccountant::new(
            registry,
            AccountantConfig {
                count_timeout: Duration::from_millis(20),
            },
        );
        let err = acc.count("x", &[Message::user("hi")]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn replace_keeps_totals_consistent() {
        let mut count = ConversationCount::default();
        count.push(MessageCount {
            tokens: 50,
            category: TokenCategory::Tool,
        });
        count.push(MessageCount {
            tokens: 10,
            category: TokenCategory::Chat,
        });
        count.replace(
            0,
            MessageCount {
                tokens: 5,
                category: TokenCategory::Tool,
            },
        );
        assert_eq!(count.totals.tool, 5);
        assert_eq!(count.total(), 15);
    }

    #[test]
    fn budget_fit_and_overage() {
        let budget = TokenBudget::new(1000, 100).with_usage(CategoryTotals {
            memory: 0,
            tool: 600,
            chat: 350,
        });
        assert_eq!(budget.available(), 900);
        assert!(!budget.fits());
        assert_eq!(budget.overage(), 50);
        assert!(budget.exceeds_ratio(0.90));
        assert!(!budget.exceeds_ratio(0.96));
        assert!(budget.to_log_string().contains("95%"));
    }

    #[test]
    fn reserve_larger_than_limit_saturates() {
        let budget = TokenBudget::new(100, 500);
        assert_eq!(budget.available(), 0);
        assert!(budget.fits());
    }
}
