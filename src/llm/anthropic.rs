//! Anthropic Messages API provider, streamed over SSE.
//!
//! `text_delta` blocks become [`StreamDelta::Text`], `thinking_delta`
//! blocks (extended thinking, enabled by `thinking_budget`) become
//! [`StreamDelta::Reasoning`].

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::client::LlmClient;
use super::{LlmResponse, Message, StreamDelta};
use crate::config::LlmConfig;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Client for Anthropic Messages API
pub struct AnthropicClient {
    client: Client,
    config: LlmConfig,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
struct ThinkingConfig {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// What one SSE message means for the response being accumulated.
#[derive(Debug, PartialEq)]
enum Step {
    Delta(StreamDelta),
    Usage {
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
    },
    Stop,
    Ignore,
}

fn parse_event(data: &str) -> Result<Step> {
    let event: StreamEvent = serde_json::from_str(data)
        .map_err(|e| anyhow::anyhow!("Malformed Claude stream event: {e}"))?;
    Ok(match event {
        StreamEvent::MessageStart { message } => {
            let usage = message.usage.unwrap_or_default();
            Step::Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            }
        }
        StreamEvent::ContentBlockDelta { delta } => match delta {
            BlockDelta::TextDelta { text } => Step::Delta(StreamDelta::Text(text)),
            BlockDelta::ThinkingDelta { thinking } => Step::Delta(StreamDelta::Reasoning(thinking)),
            BlockDelta::Other => Step::Ignore,
        },
        StreamEvent::MessageDelta { usage } => {
            let usage = usage.unwrap_or_default();
            Step::Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            }
        }
        StreamEvent::MessageStop => Step::Stop,
        StreamEvent::Error { error } => {
            anyhow::bail!("Claude API stream error ({}): {}", error.kind, error.message)
        }
        StreamEvent::Other => Step::Ignore,
    })
}

impl AnthropicClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = Client::new();
        Self { client, config }
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/v1/messages", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn stream(
        &self,
        system_prompt: &str,
        messages: &[Message],
        on_delta: &mut (dyn FnMut(StreamDelta) + Send),
    ) -> Result<LlmResponse> {
        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens_per_request,
            system: system_prompt,
            messages,
            stream: true,
            thinking: self.config.thinking_budget.map(|budget_tokens| ThinkingConfig {
                kind: "enabled",
                budget_tokens,
            }),
        };

        debug!(
            "Streaming Claude API ({}) with {} messages",
            self.config.model,
            messages.len()
        );

        let builder = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&request);

        let mut source = EventSource::new(builder)
            .map_err(|_| anyhow::anyhow!("Claude request body cannot be streamed"))?;

        let mut response = LlmResponse::default();
        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => {
                    let step = match parse_event(&message.data) {
                        Ok(step) => step,
                        Err(e) => {
                            source.close();
                            return Err(e);
                        }
                    };
                    match step {
                        Step::Delta(delta) => {
                            response.apply(&delta);
                            on_delta(delta);
                        }
                        Step::Usage {
                            input_tokens,
                            output_tokens,
                        } => {
                            if let Some(tokens) = input_tokens {
                                response.input_tokens = tokens;
                            }
                            if let Some(tokens) = output_tokens {
                                response.output_tokens = tokens;
                            }
                        }
                        Step::Stop => {
                            source.close();
                            break;
                        }
                        Step::Ignore => {}
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, body)) => {
                    source.close();
                    let body = body.text().await.unwrap_or_default();
                    anyhow::bail!("Claude API error ({status}): {body}");
                }
                Err(e) => {
                    source.close();
                    anyhow::bail!("Claude stream failed: {e}");
                }
            }
        }

        info!(
            "LLM response: {} in / {} out tokens",
            response.input_tokens, response.output_tokens
        );
        Ok(response)
    }

    fn description(&self) -> String {
        self.config.description()
    }
}
