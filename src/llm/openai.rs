//! OpenAI-compatible chat completions provider.
//!
//! Calls `POST {base_url}/chat/completions` with `stream: true` and reads
//! the SSE body chunk by chunk. Reasoning models served over this API
//! (DeepSeek R1 and friends) stream their chain of thought in
//! `delta.reasoning_content`, next to the usual `delta.content`.
//!
//! Differences from Anthropic:
//! - The system prompt is sent as a `role: "system"` message.
//! - The stream ends with a literal `[DONE]` data line.
//! - Token usage arrives in a final chunk when `include_usage` is set.

use anyhow::Result;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::client::LlmClient;
use super::{LlmResponse, Message, StreamDelta};
use crate::config::LlmConfig;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DONE_MARKER: &str = "[DONE]";

pub struct OpenAiClient {
    client: Client,
    config: LlmConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Deltas carried by one chunk (reasoning first) and its usage, if any.
fn parse_chunk(data: &str) -> Result<(Vec<StreamDelta>, Option<(u32, u32)>)> {
    let chunk: ChatChunk = serde_json::from_str(data)
        .map_err(|e| anyhow::anyhow!("Malformed chat completion chunk: {e}"))?;

    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(reasoning) = choice.delta.reasoning_content.filter(|s| !s.is_empty()) {
            deltas.push(StreamDelta::Reasoning(reasoning));
        }
        if let Some(content) = choice.delta.content.filter(|s| !s.is_empty()) {
            deltas.push(StreamDelta::Text(content));
        }
    }
    let usage = chunk
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens));
    Ok((deltas, usage))
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn stream(
        &self,
        system_prompt: &str,
        messages: &[Message],
        on_delta: &mut (dyn FnMut(StreamDelta) + Send),
    ) -> Result<LlmResponse> {
        let mut chat_messages = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            chat_messages.push(ChatMessage {
                role: "system",
                content: system_prompt,
            });
        }
        chat_messages.extend(messages.iter().map(|m| ChatMessage {
            role: &m.role,
            content: &m.content,
        }));

        let request = ChatRequest {
            model: &self.config.model,
            messages: chat_messages,
            max_tokens: self.config.max_tokens_per_request,
            stream: true,
            stream_options: StreamOptions { include_usage: true },
        };

        debug!(
            "Streaming chat completions ({}) with {} messages",
            self.config.model,
            messages.len()
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            anyhow::bail!("Chat completions API error ({status}): {body}");
        }

        let mut events = response.bytes_stream().eventsource();
        let mut result = LlmResponse::default();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| anyhow::anyhow!("Chat completions stream failed: {e}"))?;
            let data = event.data.trim();
            if data == DONE_MARKER {
                break;
            }
            if data.is_empty() {
                continue;
            }

            let (deltas, usage) = parse_chunk(data)?;
            for delta in deltas {
                result.apply(&delta);
                on_delta(delta);
            }
            if let Some((input_tokens, output_tokens)) = usage {
                result.input_tokens = input_tokens;
                result.output_tokens = output_tokens;
            }
        }

        info!(
            "LLM response: {} in / {} out tokens",
            result.input_tokens, result.output_tokens
        );
        Ok(result)
    }

    fn description(&self) -> String {
        self.config.description()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_chunk() {
        let data = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        let (deltas, usage) = parse_chunk(data).unwrap();
        assert_eq!(deltas, vec![StreamDelta::Text("Hi".into())]);
        assert!(usage.is_none());
    }

    #[test]
    fn test_parse_reasoning_chunk() {
        let data = r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":null,"reasoning_content":"Hmm"}}]}"#;
        let (deltas, _) = parse_chunk(data).unwrap();
        assert_eq!(deltas, vec![StreamDelta::Reasoning("Hmm".into())]);
    }

    #[test]
    fn test_parse_empty_strings_are_skipped() {
        let data = r#"{"choices":[{"index":0,"delta":{"content":"","reasoning_content":""}}]}"#;
        let (deltas, _) = parse_chunk(data).unwrap();
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_parse_usage_chunk() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34,"total_tokens":46}}"#;
        let (deltas, usage) = parse_chunk(data).unwrap();
        assert!(deltas.is_empty());
        assert_eq!(usage, Some((12, 34)));
    }

    #[test]
    fn test_parse_malformed_chunk() {
        assert!(parse_chunk("{not json").is_err());
    }

    #[test]
    fn test_endpoint() {
        let config = LlmConfig {
            provider: "openai".into(),
            model: "deepseek-reasoner".into(),
            api_key: "k".into(),
            base_url: Some("https://api.deepseek.com/".into()),
            max_tokens_per_request: 1024,
            thinking_budget: None,
        };
        assert_eq!(
            OpenAiClient::new(config).endpoint(),
            "https://api.deepseek.com/chat/completions"
        );
    }

    #[test]
    fn test_system_prompt_becomes_first_message() {
        let request = ChatRequest {
            model: "m",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "sys",
                },
                ChatMessage {
                    role: "user",
                    content: "q",
                },
            ],
            max_tokens: 10,
            stream: true,
            stream_options: StreamOptions { include_usage: true },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["stream_options"]["include_usage"], true);
    }
}
