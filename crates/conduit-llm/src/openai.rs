//! OpenAI-compatible Chat Completions adapter.
//!
//! Works with OpenAI itself and any compatible service (Groq, Ollama,
//! vLLM, LM Studio).

use async_trait::async_trait;
use reqwest::{Client, Response, header};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::adapter::{ProviderAdapter, RawEvent, RawEventStream, with_retry};
use crate::error::{LlmError, Result};
use crate::sse::{SseField, SseHandler, sse_stream};
use crate::types::{CompletionRequest, ContentBlock, Role, StopReason, Usage};

/// Default OpenAI API base URL.
const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";

/// Default local (Ollama) base URL.
const DEFAULT_LOCAL_BASE: &str = "http://localhost:11434/v1";

/// Default OpenAI model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Default timeout for requests.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for an OpenAI-compatible adapter.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key for authentication (optional for local services like Ollama).
    pub api_key: Option<String>,

    /// Base URL for the API.
    pub base_url: String,

    /// Model used when a request names none.
    pub model: String,

    /// Request timeout.
    pub timeout: Duration,

    /// Maximum retries for opening the stream.
    pub max_retries: u32,

    /// Initial backoff duration for retries.
    pub retry_backoff: Duration,

    /// Name for this adapter instance.
    pub name: String,
}

impl OpenAiConfig {
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            base_url: DEFAULT_OPENAI_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            name: "openai".to_string(),
        }
    }

    pub fn groq(api_key: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.3-70b-versatile".to_string(),
            name: "groq".to_string(),
            ..Self::openai(api_key)
        }
    }

    /// A local model server speaking the OpenAI protocol (Ollama by default).
    pub fn local() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_LOCAL_BASE.to_string(),
            model: "llama3.1".to_string(),
            // Local inference is slow to produce a first token.
            timeout: Duration::from_secs(600),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            name: "local".to_string(),
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

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
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
// OpenAI Adapter
// ─────────────────────────────────────────────────────────────────────────────

/// OpenAI-compatible adapter.
pub struct OpenAiAdapter {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiAdapter {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// An adapter for a local Ollama server with default settings.
    pub fn local() -> Result<Self> {
        Self::new(OpenAiConfig::local())
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn add_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(header::CONTENT_TYPE, "application/json");

        if let Some(ref api_key) = self.config.api_key {
            builder.header(header::AUTHORIZATION, format!("Bearer {}", api_key))
        } else {
            builder
        }
    }

    async fn handle_error_response(response: Response) -> LlmError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.text().await.unwrap_or_default();

        let message = serde_json::from_str::<OpenAiErrorResponse>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        LlmError::from_status(status, message, retry_after.as_deref())
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn stream(&self, request: CompletionRequest) -> Result<RawEventStream> {
        let body = to_openai_request(&request, &self.config.model);

        tracing::debug!(
            adapter = %self.config.name,
            model = %body.model,
            messages = body.messages.len(),
            tools = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            "Opening OpenAI-compatible stream"
        );

        let response = with_retry(
            self.config.max_retries,
            self.config.retry_backoff,
            &self.config.name,
            || async {
                let response = self
                    .add_headers(self.client.post(self.completions_url()))
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

        Ok(sse_stream(response.bytes_stream(), OpenAiSse::default()))
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire Request
// ─────────────────────────────────────────────────────────────────────────────

/// Convert a request to the Chat Completions shape.
///
/// Tool-role messages become one `tool` message per result, keyed by
/// `tool_call_id`.
fn to_openai_request(request: &CompletionRequest, default_model: &str) -> OpenAiChatRequest {
    let mut messages: Vec<OpenAiMessage> = Vec::new();

    if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
        messages.push(OpenAiMessage::text("system", system));
    }

    for m in &request.messages {
        let blocks = m.content.blocks();
        match m.role {
            Role::Tool => {
                for block in blocks {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = block
                    {
                        messages.push(OpenAiMessage {
                            role: "tool",
                            content: Some(content),
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id),
                        });
                    }
                }
            }
            Role::Assistant => {
                let tool_calls: Vec<OpenAiToolCall> = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, name, input } => Some(OpenAiToolCall {
                            id: id.clone(),
                            call_type: "function".to_string(),
                            function: OpenAiFunctionCall {
                                name: name.clone(),
                                arguments: match input {
                                    serde_json::Value::String(raw) => raw.clone(),
                                    other => other.to_string(),
                                },
                            },
                        }),
                        _ => None,
                    })
                    .collect();
                let text = m.content.to_text();
                messages.push(OpenAiMessage {
                    role: "assistant",
                    content: (!text.is_empty() || tool_calls.is_empty()).then_some(text),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    tool_call_id: None,
                });
            }
            Role::User => messages.push(OpenAiMessage::text("user", m.content.to_text())),
        }
    }

    let tools = (!request.tools.is_empty()).then(|| {
        request
            .tools
            .iter()
            .map(|t| OpenAiTool {
                tool_type: "function".to_string(),
                function: OpenAiFunction {
                    name: t.name.clone(),
                    description: Some(t.description.clone()),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    });

    OpenAiChatRequest {
        model: if request.model.is_empty() {
            default_model.to_string()
        } else {
            request.model.clone()
        },
        messages,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        stream: true,
        tools,
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAiMessage {
    fn text(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiError,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE Streaming
// ─────────────────────────────────────────────────────────────────────────────

/// Text always streams as block 0; tool call `i` becomes block `i + 1`.
const TEXT_BLOCK: usize = 0;

#[derive(Debug, Default)]
struct PendingCall {
    id: Option<String>,
    name: Option<String>,
    started: bool,
    /// Argument fragments that arrived before the call's name.
    held_args: String,
}

#[derive(Default)]
struct OpenAiSse {
    started: bool,
    text_open: bool,
    calls: BTreeMap<usize, PendingCall>,
    finish_seen: bool,
}

impl OpenAiSse {
    fn close_blocks(&mut self, out: &mut VecDeque<RawEvent>) {
        if self.text_open {
            self.text_open = false;
            out.push_back(RawEvent::ContentBlockStop { index: TEXT_BLOCK });
        }
        for (index, call) in std::mem::take(&mut self.calls) {
            if call.started {
                out.push_back(RawEvent::ContentBlockStop { index: index + 1 });
            } else {
                tracing::warn!(index, "dropping streamed tool call that never named its function");
            }
        }
    }

    fn on_tool_delta(&mut self, delta: OpenAiStreamToolCall, out: &mut VecDeque<RawEvent>) {
        let index = delta.index.unwrap_or(0);
        let call = self.calls.entry(index).or_default();

        if call.id.is_none() {
            call.id = delta.id.filter(|id| !id.is_empty());
        }
        let (name, arguments) = match delta.function {
            Some(f) => (f.name, f.arguments),
            None => (None, None),
        };
        if call.name.is_none() {
            call.name = name.filter(|n| !n.is_empty());
        }

        if !call.started
            && let Some(name) = &call.name
        {
            call.started = true;
            let id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            out.push_back(RawEvent::tool_use_start(index + 1, id, name.clone()));
            if !call.held_args.is_empty() {
                out.push_back(RawEvent::input_json_delta(
                    index + 1,
                    std::mem::take(&mut call.held_args),
                ));
            }
        }

        if let Some(args) = arguments.filter(|a| !a.is_empty()) {
            if call.started {
                out.push_back(RawEvent::input_json_delta(index + 1, args));
            } else {
                call.held_args.push_str(&args);
            }
        }
    }

    fn on_chunk(&mut self, chunk: OpenAiStreamChunk, out: &mut VecDeque<RawEvent>) {
        if let Some(error) = chunk.error {
            out.push_back(RawEvent::Error {
                message: error.message,
            });
            return;
        }

        if !self.started {
            self.started = true;
            out.push_back(RawEvent::MessageStart {
                id: chunk.id.unwrap_or_default(),
                model: chunk.model.unwrap_or_default(),
            });
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                    if !self.text_open {
                        self.text_open = true;
                        out.push_back(RawEvent::text_start(TEXT_BLOCK));
                    }
                    out.push_back(RawEvent::text_delta(TEXT_BLOCK, content));
                }
                for tool_call in delta.tool_calls.unwrap_or_default() {
                    self.on_tool_delta(tool_call, out);
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.close_blocks(out);
                self.finish_seen = true;
                let usage = chunk
                    .usage
                    .as_ref()
                    .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
                    .unwrap_or_default();
                out.push_back(RawEvent::MessageDelta {
                    stop_reason: StopReason::from_wire(&reason),
                    usage,
                });
            }
        }
    }
}

impl SseHandler for OpenAiSse {
    fn on_field(&mut self, field: SseField<'_>, out: &mut VecDeque<RawEvent>) -> bool {
        let SseField::Data(data) = field else {
            return false;
        };
        if data == "[DONE]" {
            self.finish(out);
            return true;
        }
        match serde_json::from_str::<OpenAiStreamChunk>(data) {
            Ok(chunk) => self.on_chunk(chunk, out),
            Err(e) => tracing::warn!(error = %e, "malformed OpenAI stream chunk"),
        }
        false
    }

    /// EOF without `[DONE]` is only a clean end once a finish_reason arrived.
    fn on_end(&mut self, out: &mut VecDeque<RawEvent>) {
        if self.finish_seen {
            self.finish(out);
        } else {
            out.push_back(RawEvent::Error {
                message: "stream ended before [DONE] or finish_reason".to_string(),
            });
        }
    }
}

impl OpenAiSse {
    fn finish(&mut self, out: &mut VecDeque<RawEvent>) {
        self.close_blocks(out);
        if self.started && !self.finish_seen {
            self.finish_seen = true;
            out.push_back(RawEvent::MessageDelta {
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
            });
        }
        out.push_back(RawEvent::MessageStop);
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
    error: Option<OpenAiError>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: Option<OpenAiStreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: Option<OpenAiStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
