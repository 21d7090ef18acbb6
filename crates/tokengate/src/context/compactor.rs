//! Last-resort compaction of conversation history.
//!
//! The conversation is partitioned into three groups:
//!
//! - **System messages**: always kept, in place.
//! - **Recent exchanges**: the last `preserve_count` exchanges, where an
//!   exchange starts at a user message and runs up to the next one. Kept
//!   verbatim.
//! - **The middle**: every other non-system message. Replaced by one
//!   summary message at the position of the earliest message removed.
//!
//! If the summarize capability fails, times out, or returns nothing, the
//! conversation comes back unchanged. Dropping the middle without a
//! replacement would lose continuity silently.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::capabilities::Summarize;
use crate::context::accountant::{ConversationCount, TokenAccountant};
use crate::error::Result;
use crate::pipeline::StageWarning;
use crate::{Message, MessageRole};

/// Prefix of the synthetic summary message. `{n}` is the number of messages
/// it replaces.
pub const SUMMARY_PREFIX: &str = "[Context summary of";

/// Configuration for the [`Compactor`].
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Recent exchanges kept verbatim.
    pub preserve_count: usize,
    /// Maximum characters of summary spliced into the conversation.
    pub max_summary_chars: usize,
    /// Compaction runs only while `used > limit * trigger_ratio`.
    pub trigger_ratio: f64,
    /// Upper bound on the summarize call.
    pub timeout: Duration,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            preserve_count: 2,
            max_summary_chars: 8_000,
            trigger_ratio: 0.85,
            timeout: Duration::from_secs(60),
        }
    }
}

impl CompactorConfig {
    pub fn with_preserve_count(mut self, exchanges: usize) -> Self {
        self.preserve_count = exchanges;
        self
    }

    pub fn with_trigger_ratio(mut self, ratio: f64) -> Self {
        self.trigger_ratio = ratio;
        self
    }

    pub fn with_max_summary_chars(mut self, chars: usize) -> Self {
        self.max_summary_chars = chars;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of one compaction.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// The conversation after compaction (unchanged when nothing was done).
    pub conversation: Vec<Message>,
    /// System messages plus the preserved recent exchanges, in order.
    pub preserved_messages: Vec<Message>,
    pub summary_message: Option<Message>,
    /// Counts for `conversation`.
    pub count: ConversationCount,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub warnings: Vec<StageWarning>,
}

impl CompactionResult {
    pub fn compacted(&self) -> bool {
        self.summary_message.is_some()
    }

    fn unchanged(
        conversation: &[Message],
        count: &ConversationCount,
        warnings: Vec<StageWarning>,
    ) -> Self {
        Self {
            conversation: conversation.to_vec(),
            preserved_messages: conversation.to_vec(),
            summary_message: None,
            count: count.clone(),
            tokens_before: count.total(),
            tokens_after: count.total(),
            warnings,
        }
    }
}

/// Whether `message` is a summary spliced in by an earlier compaction.
pub fn is_summary(message: &Message) -> bool {
    message.role == MessageRole::User && message.content.starts_with(SUMMARY_PREFIX)
}

/// Index of the first message of the preserved tail.
///
/// The tail starts at the `preserve_count`-th user message from the end.
/// Earlier summaries don't start an exchange.
/// When there are fewer user messages than that (one task followed by a long
/// tool loop), the last `2 * preserve_count` non-system messages are kept
/// instead.
fn tail_start(conversation: &[Message], preserve_count: usize) -> usize {
    if preserve_count == 0 {
        return conversation.len();
    }
    let by_exchange = conversation
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, m)| m.role == MessageRole::User && !is_summary(m))
        .nth(preserve_count - 1)
        .map(|(i, _)| i);
    if let Some(start) = by_exchange {
        return start;
    }
    conversation
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, m)| !m.is_system())
        .nth(2 * preserve_count - 1)
        .map_or(0, |(i, _)| i)
}

/// Format messages as `[role]: content` blocks for the summarizer.
pub fn render_for_summary(messages: &[&Message]) -> String {
    let mut content = String::new();
    for msg in messages {
        content.push_str(&format!("[{}]: {}\n\n", msg.role, msg.content));
    }
    content
}

/// Summarizes the middle of a conversation through a [`Summarize`] capability.
#[derive(Clone)]
pub struct Compactor {
    accountant: TokenAccountant,
    summarizer: Arc<dyn Summarize>,
    config: CompactorConfig,
}

impl Compactor {
    pub fn new(
        accountant: TokenAccountant,
        summarizer: Arc<dyn Summarize>,
        config: CompactorConfig,
    ) -> Self {
        Self {
            accountant,
            summarizer,
            config,
        }
    }

    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    /// Compact `conversation`, whose counts are `count`.
    ///
    /// Fails only when the tokenizer fails while counting the summary.
    pub async fn compact(
        &self,
        family: &str,
        conversation: &[Message],
        count: &ConversationCount,
    ) -> Result<CompactionResult> {
        let tail = tail_start(conversation, self.config.preserve_count);
        let middle: Vec<usize> = (0..tail).filter(|&i| !conversation[i].is_system()).collect();

        let Some(&first_removed) = middle.first() else {
            debug!("Nothing to compact: middle is empty");
            return Ok(CompactionResult::unchanged(conversation, count, Vec::new()));
        };

        let removed: Vec<&Message> = middle.iter().map(|&i| &conversation[i]).collect();
        let text = render_for_summary(&removed);

        let max_chars = self.config.max_summary_chars;
        let call = self.summarizer.summarize(&text, max_chars);
        let summary = match tokio::time::timeout(self.config.timeout, call).await {
            Ok(Ok(s)) if !s.trim().is_empty() => s,
            Ok(Ok(_)) => {
                warn!("Summarizer returned an empty summary; leaving conversation unchanged");
                return Ok(CompactionResult::unchanged(
                    conversation,
                    count,
                    vec![StageWarning::new("summarizer_failed", "empty summary")],
                ));
            }
            Ok(Err(e)) => {
                warn!("Summarizer failed; leaving conversation unchanged: {e}");
                return Ok(CompactionResult::unchanged(
                    conversation,
                    count,
                    vec![StageWarning::new("summarizer_failed", e.to_string())],
                ));
            }
            Err(_) => {
                warn!("Summarizer timed out after {:?}", self.config.timeout);
                return Ok(CompactionResult::unchanged(
                    conversation,
                    count,
                    vec![StageWarning::new(
                        "timeout",
                        format!("summarizer timed out after {:?}", self.config.timeout),
                    )],
                ));
            }
        };

        let summary = crate::preview(summary.trim(), self.config.max_summary_chars);
        let mut summary_message = Message::user(format!(
            "{SUMMARY_PREFIX} {} earlier messages]\n{summary}",
            middle.len()
        ));
        summary_message.sequence_index = conversation[first_removed].sequence_index;
        let summary_count = self
            .accountant
            .count_message(family, &summary_message)
            .await?;

        let mut out = Vec::with_capacity(conversation.len() - middle.len() + 1);
        let mut new_count = ConversationCount::default();
        let mut preserved = Vec::new();
        for (index, message) in conversation.iter().enumerate() {
            if index == first_removed {
                out.push(summary_message.clone());
                new_count.per_message.push(summary_count);
            }
            if index < tail && !message.is_system() {
                continue;
            }
            out.push(message.clone());
            preserved.push(message.clone());
            if let Some(c) = count.per_message.get(index) {
                new_count.per_message.push(*c);
            }
        }
        new_count.recompute_totals();

        info!(
            "Compacted {} message(s) into one summary: {} -> {} tokens",
            middle.len(),
            count.total(),
            new_count.total()
        );

        Ok(CompactionResult {
            conversation: out,
            preserved_messages: preserved,
            summary_message: Some(summary_message),
            tokens_before: count.total(),
            tokens_after: new_count.total(),
            count: new_count,
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilityFuture, FnTokenCounter, TokenizerRegistry};
    use crate::context::accountant::AccountantConfig;
    use crate::error::CapabilityError;
    use std::sync::Mutex;

    struct CannedSummarizer {
        reply: std::result::Result<String, CapabilityError>,
        seen: Mutex<Vec<String>>,
    }

    impl CannedSummarizer {
        fn ok(reply: &str) -> Self {
            Self {
                reply: Ok(reply.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
        fn failing() -> Self {
            Self {
                reply: Err(CapabilityError::Unavailable("offline".into())),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Summarize for CannedSummarizer {
        fn summarize<'a>(&'a self, text: &'a str, _max: usize) -> CapabilityFuture<'a, String> {
            self.seen.lock().unwrap().push(text.to_string());
            let reply = self.reply.clone();
            Box::pin(async move { reply })
        }
    }

    fn accountant() -> TokenAccountant {
        TokenAccountant::new(
            Arc::new(TokenizerRegistry::new().with(
                "acme",
                Arc::new(FnTokenCounter::new(|t: &str| t.split_whitespace().count())),
            )),
            AccountantConfig::default(),
        )
    }

    fn ten_messages() -> Vec<Message> {
        crate::index_conversation(vec![
            Message::system("sys one"),
            Message::user("first question about parsing"),
            Message::assistant("long answer about parsing details"),
            Message::system("sys two"),
            Message::user("second question about lexing"),
            Message::assistant("long answer about lexing details"),
            Message::user("third question"),
            Message::assistant("third answer"),
            Message::user("fourth question"),
            Message::assistant("fourth answer"),
        ])
    }

    async fn compact_with(
        summarizer: Arc<CannedSummarizer>,
        conversation: &[Message],
    ) -> CompactionResult {
        let acc = accountant();
        let count = acc.count("acme", conversation).await.unwrap();
        Compactor::new(acc, summarizer, CompactorConfig::default())
            .compact("acme", conversation, &count)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn preserves_system_and_recent_exchanges() {
        let conversation = ten_messages();
        let summarizer = Arc::new(CannedSummarizer::ok("parsing and lexing discussed"));
        let result = compact_with(summarizer.clone(), &conversation).await;

        assert!(result.compacted());
        assert_eq!(result.conversation.len(), 2 + 4 + 1);
        let summaries: Vec<_> = result
            .conversation
            .iter()
            .filter(|m| m.content.starts_with(SUMMARY_PREFIX))
            .collect();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].content.contains("of 4 earlier messages"));
        assert_eq!(&result.conversation[3..], &conversation[6..]);
        assert!(result.conversation.iter().filter(|m| m.is_system()).count() == 2);
        assert_eq!(result.preserved_messages.len(), 6);
        assert_eq!(result.count.per_message.len(), result.conversation.len());
        assert!(result.tokens_after < result.tokens_before);

        let seen = summarizer.seen.lock().unwrap();
        assert!(seen[0].contains("[user]: first question about parsing"));
        assert!(!seen[0].contains("sys two"));
    }

    #[tokio::test]
    async fn summary_takes_earliest_removed_position() {
        let conversation = ten_messages();
        let result = compact_with(Arc::new(CannedSummarizer::ok("s")), &conversation).await;
        assert_eq!(result.conversation[0], conversation[0]);
        assert!(result.conversation[1].content.starts_with(SUMMARY_PREFIX));
        assert_eq!(result.conversation[1].sequence_index, 1);
        assert_eq!(result.conversation[1].role, MessageRole::User);
        assert_eq!(result.conversation[2], conversation[3]);
    }

    #[tokio::test]
    async fn empty_middle_is_a_no_op() {
        let conversation = crate::index_conversation(vec![
            Message::system("sys"),
            Message::user("q1"),
            Message::assistant("a1"),
            Message::user("q2"),
            Message::assistant("a2"),
        ]);
        let summarizer = Arc::new(CannedSummarizer::ok("unused"));
        let result = compact_with(summarizer.clone(), &conversation).await;
        assert!(!result.compacted());
        assert_eq!(result.conversation, conversation);
        assert_eq!(result.tokens_before, result.tokens_after);
        assert!(summarizer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn summarizer_failure_returns_input() {
        let conversation = ten_messages();
        let result = compact_with(Arc::new(CannedSummarizer::failing()), &conversation).await;
        assert_eq!(result.conversation, conversation);
        assert_eq!(result.warnings[0].code, "summarizer_failed");
        assert_eq!(result.tokens_before, result.tokens_after);
    }

    #[tokio::test]
    async fn empty_summary_is_a_failure() {
        let conversation = ten_messages();
        let result = compact_with(Arc::new(CannedSummarizer::ok("  ")), &conversation).await;
        assert!(!result.compacted());
        assert_eq!(result.conversation, conversation);
    }

    #[tokio::test]
    async fn earlier_summary_is_not_kept_as_an_exchange() {
        let conversation = crate::index_conversation(vec![
            Message::system("sys"),
            Message::user("first task"),
            Message::assistant("first answer"),
            Message::user(format!("{SUMMARY_PREFIX} 6 earlier messages]
old summary")),
            Message::assistant("answer after the summary"),
            Message::user("second question"),
            Message::assistant("second answer"),
            Message::user("third question"),
            Message::assistant("third answer"),
        ]);
        assert_eq!(tail_start(&conversation, 2), 5);

        let summarizer = Arc::new(CannedSummarizer::ok("everything so far"));
        let result = compact_with(summarizer.clone(), &conversation).await;
        assert_eq!(&result.conversation[2..], &conversation[5..]);
        let summaries = result.conversation.iter().filter(|m| is_summary(m)).count();
        assert_eq!(summaries, 1);
        assert!(summarizer.seen.lock().unwrap()[0].contains("old summary"));
    }

    #[test]
    fn single_task_tool_loop_keeps_last_messages() {
        let mut conversation = vec![Message::system("s"), Message::user("do the task")];
        for i in 0..6 {
            conversation.push(Message::assistant(format!("step {i}")));
            conversation.push(Message::tool_result(format!("c{i}"), "out"));
        }
        let start = tail_start(&conversation, 2);
        assert_eq!(conversation.len() - start, 4);
    }
}
