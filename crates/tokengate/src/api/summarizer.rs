//! [`Summarize`] over a chat completion endpoint.

use std::time::Duration;

use tracing::debug;

use super::client::{ChatClient, ChatMessage, ChatRequest, DEFAULT_CHAT_URL};
use crate::capabilities::{CapabilityFuture, Summarize};
use crate::error::CapabilityError;

/// Environment variable holding the summarizer endpoint URL.
pub const SUMMARY_URL_ENV: &str = "TOKENGATE_SUMMARY_URL";
/// Environment variable holding the summarizer model.
pub const SUMMARY_MODEL_ENV: &str = "TOKENGATE_SUMMARY_MODEL";
/// Environment variable holding the summarizer API key.
pub const SUMMARY_KEY_ENV: &str = "TOKENGATE_SUMMARY_API_KEY";

const DEFAULT_SUMMARY_MODEL: &str = "google/gemini-2.5-flash";

const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation messages concisely. Focus on:
- What was accomplished (completed subtasks, files modified)
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- File paths and function names mentioned
- Current plan state and what remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- Be concise: every token must earn its place.";

/// Summarizes conversation text with a (usually cheap) chat model.
#[derive(Debug)]
pub struct LlmSummarizer {
    client: ChatClient,
    model: String,
}

impl LlmSummarizer {
    pub fn new(client: ChatClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Build from `TOKENGATE_SUMMARY_API_KEY` and optionally
    /// `TOKENGATE_SUMMARY_URL` / `TOKENGATE_SUMMARY_MODEL`. `Ok(None)` when
    /// the key is unset.
    pub fn from_env(timeout: Duration) -> Result<Option<Self>, String> {
        let Ok(key) = std::env::var(SUMMARY_KEY_ENV) else {
            return Ok(None);
        };
        let url = std::env::var(SUMMARY_URL_ENV).unwrap_or_else(|_| DEFAULT_CHAT_URL.into());
        let model = std::env::var(SUMMARY_MODEL_ENV).ok();
        let model = model.unwrap_or_else(|| DEFAULT_SUMMARY_MODEL.into());
        let client = ChatClient::new(url, key, timeout)?;
        Ok(Some(Self::new(client, model)))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, text: &str, max_length: usize) -> ChatRequest {
        // Roughly four characters per token; the compactor truncates anyway.
        let max_tokens = u32::try_from(max_length / 4).unwrap_or(u32::MAX).max(64);
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(format!(
                    "{SUMMARIZATION_PROMPT}\n- Stay under {max_length} characters."
                )),
                ChatMessage::user(text),
            ],
            max_tokens,
            temperature: Some(0.2),
        }
    }

    async fn call(&self, text: &str, max_length: usize) -> Result<String, CapabilityError> {
        let completion = self.client.chat(&self.request(text, max_length)).await?;
        let summary = completion
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| CapabilityError::Malformed("empty summary".into()))?;
        debug!(
            "Summarized {} chars into {} chars with {}",
            text.len(),
            summary.len(),
            self.model
        );
        Ok(summary)
    }
}

impl Summarize for LlmSummarizer {
    fn summarize<'a>(&'a self, text: &'a str, max_length: usize) -> CapabilityFuture<'a, String> {
        Box::pin(self.call(text, max_length))
    }
}
