//! `LlmClient` trait: abstraction over streaming LLM backends.
//!
//! Providers (Anthropic, OpenAI-compatible) implement this trait so the
//! expert dispatcher can be configured to use any supported backend via
//! the `[llm] provider` config field.

use anyhow::Result;
use async_trait::async_trait;

use super::{LlmResponse, Message, StreamDelta};

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Streams a completion for `messages`.
    ///
    /// `on_delta` is called for every reasoning or text chunk in arrival
    /// order. The returned response holds the concatenation of all chunks
    /// plus token usage when the provider reports it.
    async fn stream(
        &self,
        system_prompt: &str,
        messages: &[Message],
        on_delta: &mut (dyn FnMut(StreamDelta) + Send),
    ) -> Result<LlmResponse>;

    /// Human-readable description of the provider and model.
    ///
    /// Used in status output, e.g. `"anthropic (claude-sonnet-4-5)"`.
    fn description(&self) -> String;
}
