//! Anthropic Messages API adapter.
//!
//! Streams `POST /v1/messages` with `stream: true` and maps the SSE
//! `event:`/`data:` pairs onto [`RawEvent`]s.

use async_trait::async_trait;
use reqwest::{Client, Response, header};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::adapter::{ProviderAdapter, RawEvent, RawEventStream, with_retry};
use crate::error::{LlmError, Result};
use crate::sse::{SseField, SseHandler, sse_stream};
use crate::types::{CompletionRequest, ContentBlock, Role, StopReason, ToolDefinition, Usage};

/// Default API base URL.
const DEFAULT_API_BASE: &str = "https://api.anthropic.com";

/// Default API version.
const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Default model when the configuration names none.
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";

/// Default timeout for requests.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the Anthropic adapter.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    /// API key for authentication.
    pub api_key: String,

    /// Base URL for the API.
    pub base_url: String,

    /// API version header.
    pub api_version: String,

    /// Model used when a request names none.
    pub model: String,

    /// Request timeout.
    pub timeout: Duration,

    /// Maximum retries for opening the stream.
    pub max_retries: u32,

    /// Initial backoff duration for retries.
    pub retry_backoff: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_API_BASE.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Anthropic Adapter
// ─────────────────────────────────────────────────────────────────────────────

/// Anthropic API adapter.
pub struct AnthropicAdapter {
    client: Client,
    config: AnthropicConfig,
}

impl AnthropicAdapter {
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    fn add_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.api_version)
            .header(header::CONTENT_TYPE, "application/json")
    }

    async fn handle_error_response(response: Response) -> LlmError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.text().await.unwrap_or_default();

        let message = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        LlmError::from_status(status, message, retry_after.as_deref())
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn stream(&self, request: CompletionRequest) -> Result<RawEventStream> {
        let body = to_anthropic_request(&request, &self.config.model);

        tracing::debug!(
            adapter = "anthropic",
            model = %body.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "Opening Anthropic stream"
        );

        let response = with_retry(
            self.config.max_retries,
            self.config.retry_backoff,
            "anthropic",
            || async {
                let response = self
                    .add_headers(self.client.post(self.messages_url()))
                    .json(&body)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(Self::handle_error_response(response).await);
                }
                Ok(response)
            },
        )
        .await?;

        Ok(sse_stream(response.bytes_stream(), AnthropicSse::default()))
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire Request
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

/// Convert a request to the Messages API shape.
///
/// Tool-role messages become `user` messages of `tool_result` blocks, and
/// consecutive ones are merged: the API wants every result for an assistant
/// turn in the single user message that follows it.
fn to_anthropic_request<'a>(
    request: &'a CompletionRequest,
    default_model: &'a str,
) -> AnthropicRequest<'a> {
    let mut messages: Vec<AnthropicMessage> = Vec::new();
    let mut previous_was_tool = false;

    for message in &request.messages {
        let blocks: Vec<ContentBlock> = message
            .content
            .blocks()
            .into_iter()
            .filter(|b| !matches!(b, ContentBlock::Text { text } if text.is_empty()))
            .collect();
        if blocks.is_empty() {
            continue;
        }

        match message.role {
            Role::Tool => {
                match messages.last_mut() {
                    Some(last) if previous_was_tool => last.content.extend(blocks),
                    _ => messages.push(AnthropicMessage {
                        role: "user",
                        content: blocks,
                    }),
                }
                previous_was_tool = true;
            }
            Role::User => {
                messages.push(AnthropicMessage {
                    role: "user",
                    content: blocks,
                });
                previous_was_tool = false;
            }
            Role::Assistant => {
                messages.push(AnthropicMessage {
                    role: "assistant",
                    content: blocks,
                });
                previous_was_tool = false;
            }
        }
    }

    AnthropicRequest {
        model: if request.model.is_empty() {
            default_model
        } else {
            &request.model
        },
        max_tokens: request.max_tokens,
        messages,
        system: request.system.as_deref().filter(|s| !s.is_empty()),
        tools: &request.tools,
        temperature: request.temperature,
        stream: true,
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE Stream Parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct AnthropicSse {
    current_event: Option<String>,
    errored: bool,
}

impl SseHandler for AnthropicSse {
    fn on_field(&mut self, field: SseField<'_>, out: &mut VecDeque<RawEvent>) -> bool {
        match field {
            SseField::Event(name) => {
                self.current_event = Some(name.to_string());
                false
            }
            SseField::Boundary => {
                self.current_event = None;
                false
            }
            SseField::Data(data) => {
                let event_type = match &self.current_event {
                    Some(name) => name.clone(),
                    // Fall back to the payload's own type tag.
                    None => match serde_json::from_str::<TypeTag>(data) {
                        Ok(tag) => tag.event_type,
                        Err(_) => return false,
                    },
                };
                match parse_stream_event(&event_type, data) {
                    Some(event) => {
                        let done = event == RawEvent::MessageStop;
                        self.errored |= matches!(event, RawEvent::Error { .. });
                        out.push_back(event);
                        done
                    }
                    None => false,
                }
            }
        }
    }

    /// Only reached when `message_stop` never arrived.
    fn on_end(&mut self, out: &mut VecDeque<RawEvent>) {
        if !self.errored {
            out.push_back(RawEvent::Error {
                message: "stream ended before message_stop".to_string(),
            });
        }
    }
}

fn parse_stream_event(event_type: &str, data: &str) -> Option<RawEvent> {
    let parsed: serde_json::Result<Option<RawEvent>> = match event_type {
        "message_start" => serde_json::from_str::<MessageStartEvent>(data).map(|e| {
            Some(RawEvent::MessageStart {
                id: e.message.id,
                model: e.message.model,
            })
        }),
        "content_block_start" => {
            serde_json::from_str::<ContentBlockStartEvent>(data).map(|e| match e.content_block {
                StartBlock::Text => Some(RawEvent::text_start(e.index)),
                StartBlock::ToolUse { id, name } => {
                    Some(RawEvent::tool_use_start(e.index, id, name))
                }
                // Thinking and other block kinds are not surfaced.
                StartBlock::Other => None,
            })
        }
        "content_block_delta" => {
            serde_json::from_str::<ContentBlockDeltaEvent>(data).map(|e| match e.delta {
                DeltaContent::TextDelta { text } => Some(RawEvent::text_delta(e.index, text)),
                DeltaContent::InputJsonDelta { partial_json } => {
                    Some(RawEvent::input_json_delta(e.index, partial_json))
                }
                DeltaContent::Other => None,
            })
        }
        "content_block_stop" => serde_json::from_str::<ContentBlockStopEvent>(data)
            .map(|e| Some(RawEvent::ContentBlockStop { index: e.index })),
        "message_delta" => serde_json::from_str::<MessageDeltaEvent>(data).map(|e| {
            Some(RawEvent::MessageDelta {
                stop_reason: e
                    .delta
                    .stop_reason
                    .as_deref()
                    .map(StopReason::from_wire)
                    .unwrap_or(StopReason::EndTurn),
                usage: Usage::new(0, e.usage.map(|u| u.output_tokens).unwrap_or(0)),
            })
        }),
        "message_stop" => Ok(Some(RawEvent::MessageStop)),
        "ping" => Ok(Some(RawEvent::Ping)),
        "error" => {
            let message = serde_json::from_str::<ApiError>(data)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| "Unknown streaming error".to_string());
            Ok(Some(RawEvent::Error { message }))
        }
        other => {
            tracing::debug!(event = other, "ignoring unknown Anthropic stream event");
            Ok(None)
        }
    };

    parsed.unwrap_or_else(|e| {
        tracing::warn!(event = event_type, error = %e, "malformed Anthropic stream event");
        None
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE Event Structures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TypeTag {
    #[serde(rename = "type")]
    event_type: String,
}

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    message: MessageStartMessage,
}

#[derive(Debug, Deserialize)]
struct MessageStartMessage {
    id: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStartEvent {
    index: usize,
    content_block: StartBlock,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text,
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    index: usize,
    delta: DeltaContent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DeltaContent {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStopEvent {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    delta: MessageDelta,
    usage: Option<MessageDeltaUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaUsage {
    output_tokens: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
