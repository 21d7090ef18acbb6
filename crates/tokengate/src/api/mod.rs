//! Remote LLM access for the capabilities that need one.
//!
//! - [`client`]: OpenAI-compatible chat completion client.
//! - [`retry`]: transient error detection and exponential backoff.
//! - [`summarizer`]: [`LlmSummarizer`], the [`Summarize`](crate::capabilities::Summarize)
//!   implementation the compactor uses in production.

pub mod client;
pub mod retry;
pub mod summarizer;

pub use client::{ChatClient, ChatCompletion, ChatMessage, ChatRequest};
pub use retry::RetryConfig;
pub use summarizer::LlmSummarizer;
