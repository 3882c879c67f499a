pub mod anthropic;
pub mod client;
pub mod openai;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;

pub use anthropic::AnthropicClient;
pub use client::LlmClient;
pub use openai::OpenAiClient;

/// One conversation turn.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Incremental piece of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    Reasoning(String),
    Text(String),
}

/// Accumulated result of a streamed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LlmResponse {
    pub reasoning: String,
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl LlmResponse {
    pub fn apply(&mut self, delta: &StreamDelta) {
        match delta {
            StreamDelta::Reasoning(chunk) => self.reasoning.push_str(chunk),
            StreamDelta::Text(chunk) => self.text.push_str(chunk),
        }
    }
}

/// Builds the client for `config.provider`.
pub fn from_config(config: &LlmConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicClient::new(config.clone()))),
        "openai" => Ok(Arc::new(OpenAiClient::new(config.clone()))),
        other => anyhow::bail!("Unknown LLM provider: {other}"),
    }
}
