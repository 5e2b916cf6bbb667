//! The query orchestration loop.
//!
//! One [`OrchestrationEngine`] answers one query. [`submit`] consumes it and
//! returns a lazy [`QueryStream`]; nothing runs until the caller polls.
//! Each round streams one provider turn through a fresh [`ChunkDecoder`],
//! forwards text as it is decoded, then runs any requested tools and feeds
//! their results back for the next turn.
//!
//! [`submit`]: OrchestrationEngine::submit

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;

use conduit_llm::{
    CompletionRequest, LlmError, Message, RawEvent, RawEventStream, SharedAdapter, ToolDefinition,
};
use conduit_mcp::{ToolRegistry, ToolSnapshot};

use crate::conversation::Conversation;
use crate::decoder::{ChunkDecoder, DecodedEvent, ToolCallRequest};
use crate::error::{EngineError, Result};
use crate::unwrap::UnwrapRules;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Per-engine settings. Passed in explicitly; never read from globals.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Tool rounds allowed before the query is truncated.
    pub max_rounds: u32,
    /// Deadline for one whole provider call, from request to last event.
    pub provider_timeout: Duration,
    /// Timeout for each tool invocation.
    pub tool_timeout: Duration,
    /// Run the tools of one round concurrently.
    pub parallel_tools: bool,
    /// Model override; the adapter's model when `None`.
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub unwrap_rules: UnwrapRules,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            provider_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(30),
            parallel_tools: true,
            model: None,
            system_prompt: None,
            max_tokens: 4096,
            temperature: None,
            unwrap_rules: UnwrapRules::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_parallel_tools(mut self, parallel: bool) -> Self {
        self.parallel_tools = parallel;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_unwrap_rules(mut self, rules: UnwrapRules) -> Self {
        self.unwrap_rules = rules;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Query events
// ─────────────────────────────────────────────────────────────────────────────

/// An event on a query stream. `Done` or `Error` always comes last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    /// Decoded text, in provider order.
    Text { content: String },
    /// A tool is about to run.
    ToolStart {
        id: String,
        name: String,
        arguments: Value,
    },
    /// A tool finished.
    ToolEnd {
        id: String,
        name: String,
        success: bool,
    },
    /// The query completed normally.
    Done { rounds: u32 },
    /// The query ended early. Text already emitted stays valid.
    Error { kind: String, message: String },
}

impl QueryEvent {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn error(err: &EngineError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Lazy sequence of query events.
pub type QueryStream = Pin<Box<dyn Stream<Item = QueryEvent> + Send>>;

/// Where a query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Streaming,
    AwaitingTools,
    Done,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Streaming => "streaming",
            EngineState::AwaitingTools => "awaiting_tools",
            EngineState::Done => "done",
        };
        f.write_str(name)
    }
}

fn transition(state: &mut EngineState, next: EngineState) {
    if *state != next {
        tracing::debug!(from = %state, to = %next, "engine state");
        *state = next;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`OrchestrationEngine`].
#[derive(Default)]
pub struct EngineBuilder {
    provider: Option<SharedAdapter>,
    registry: Option<Arc<ToolRegistry>>,
    config: EngineConfig,
    history: Vec<Message>,
    cancel: Option<CancellationToken>,
    archive: Option<oneshot::Sender<Vec<Message>>>,
}

impl EngineBuilder {
    pub fn provider(mut self, provider: SharedAdapter) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Earlier turns of the conversation this query continues.
    pub fn history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Receives the final conversation when the query ends.
    pub fn archive(mut self, sender: oneshot::Sender<Vec<Message>>) -> Self {
        self.archive = Some(sender);
        self
    }

    pub fn build(self) -> Result<OrchestrationEngine> {
        let provider = self
            .provider
            .ok_or_else(|| EngineError::Config("engine needs a provider".to_string()))?;
        if self.config.max_rounds == 0 {
            return Err(EngineError::Config("max_rounds must be at least 1".to_string()));
        }
        Ok(OrchestrationEngine {
            provider,
            registry: self.registry.unwrap_or_default(),
            config: self.config,
            history: self.history,
            cancel: self.cancel.unwrap_or_default(),
            archive: self.archive,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Answers one query against a provider and a tool registry.
pub struct OrchestrationEngine {
    provider: SharedAdapter,
    registry: Arc<ToolRegistry>,
    config: EngineConfig,
    history: Vec<Message>,
    cancel: CancellationToken,
    archive: Option<oneshot::Sender<Vec<Message>>>,
}

/// How one provider turn ended.
enum TurnEnd {
    Complete,
    Failed(EngineError),
}

impl OrchestrationEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the query. The returned stream ends with exactly one `Done` or
    /// `Error` event. Dropping it cancels all in-flight work.
    pub fn submit(self, query: impl Into<String>) -> QueryStream {
        let query = query.into();
        let OrchestrationEngine {
            provider,
            registry,
            config,
            history,
            cancel,
            archive,
        } = self;

        Box::pin(async_stream::stream! {
            let mut state = EngineState::Idle;
            let mut conversation = Conversation::from_history(history);
            conversation.push(Message::user(query));
            let mut rounds: u32 = 0;

            tracing::debug!(
                provider = %provider.name(),
                history = conversation.len() - 1,
                "query submitted"
            );

            let outcome: Result<()> = 'query: loop {
                if cancel.is_cancelled() {
                    break 'query Err(EngineError::Cancelled);
                }

                transition(&mut state, EngineState::Streaming);
                let snapshot = registry.snapshot();
                let request = build_request(&config, &provider, &conversation, &snapshot);
                let mut decoder = ChunkDecoder::new(config.unwrap_rules.clone()).with_tools(
                    snapshot
                        .iter()
                        .map(|t| (t.qualified_name.clone(), t.name.clone())),
                );
                let deadline = Instant::now() + config.provider_timeout;

                let opened = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                    opened = timeout_at(deadline, provider.stream(request)) => match opened {
                        Err(_) => Err(EngineError::ProviderTimeout(config.provider_timeout)),
                        Ok(result) => result.map_err(EngineError::Provider),
                    },
                };
                let mut raw: RawEventStream = match opened {
                    Ok(raw) => raw,
                    Err(e) => break 'query Err(e),
                };

                let mut text = String::new();
                let mut calls: Vec<ToolCallRequest> = Vec::new();
                let turn_end = loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break TurnEnd::Failed(EngineError::Cancelled),
                        next = timeout_at(deadline, raw.next()) => next,
                    };
                    let event = match next {
                        Err(_) => {
                            break TurnEnd::Failed(EngineError::ProviderTimeout(
                                config.provider_timeout,
                            ));
                        }
                        // A finished turn always ends with MessageStop; bare EOF is a cut-off stream.
                        Ok(None) => {
                            break TurnEnd::Failed(EngineError::Provider(LlmError::Network(
                                "stream ended before message_stop".to_string(),
                            )));
                        }
                        Ok(Some(Err(e))) => break TurnEnd::Failed(EngineError::Provider(e)),
                        Ok(Some(Ok(RawEvent::Error { message }))) => {
                            break TurnEnd::Failed(EngineError::Provider(LlmError::Backend(message)));
                        }
                        Ok(Some(Ok(event))) => event,
                    };

                    let stop = matches!(event, RawEvent::MessageStop);
                    for decoded in decoder.decode(event) {
                        match decoded {
                            DecodedEvent::Text(fragment) => {
                                text.push_str(&fragment);
                                yield QueryEvent::text(fragment);
                            }
                            DecodedEvent::ToolCall(call) => calls.push(call),
                        }
                    }
                    if stop {
                        break TurnEnd::Complete;
                    }
                };
                drop(raw);

                // Whatever is still buffered is flushed even when the turn failed.
                for decoded in decoder.finish() {
                    match decoded {
                        DecodedEvent::Text(fragment) => {
                            text.push_str(&fragment);
                            yield QueryEvent::text(fragment);
                        }
                        DecodedEvent::ToolCall(call) => calls.push(call),
                    }
                }
                if decoder.fallback_count() > 0 {
                    tracing::debug!(fallbacks = decoder.fallback_count(), "turn used decode fallbacks");
                }

                if let TurnEnd::Failed(err) = turn_end {
                    conversation.push_assistant_turn(&text, &[]);
                    break 'query Err(err);
                }

                if calls.is_empty() {
                    conversation.push_assistant_turn(&text, &[]);
                    break 'query Ok(());
                }

                rounds += 1;
                if rounds > config.max_rounds {
                    tracing::warn!(max_rounds = config.max_rounds, "tool round limit reached");
                    conversation.push_assistant_turn(&text, &[]);
                    break 'query Err(EngineError::Truncated { max_rounds: config.max_rounds });
                }

                transition(&mut state, EngineState::AwaitingTools);
                conversation.push_assistant_turn(&text, &calls);
                for call in &calls {
                    yield QueryEvent::ToolStart {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    };
                }

                let dispatched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    results = dispatch_all(&registry, &calls, &config) => Some(results),
                };
                let Some(results) = dispatched else {
                    // Close out the tool calls so the archived history stays well formed.
                    for call in &calls {
                        conversation.push(Message::tool_result(&call.id, "cancelled", true));
                    }
                    break 'query Err(EngineError::Cancelled);
                };

                for (call, result) in calls.iter().zip(results) {
                    let (content, success) = match result {
                        Ok(content) => (content, true),
                        Err(err) => {
                            tracing::warn!(
                                tool = %call.name,
                                kind = err.kind(),
                                error = %err,
                                "tool call failed, reporting to provider"
                            );
                            (err.to_string(), false)
                        }
                    };
                    yield QueryEvent::ToolEnd {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        success,
                    };
                    conversation.push(Message::tool_result(&call.id, content, !success));
                }
            };

            transition(&mut state, EngineState::Done);
            let terminal = match &outcome {
                Ok(()) => {
                    tracing::debug!(rounds, messages = conversation.len(), "query complete");
                    QueryEvent::Done { rounds }
                }
                Err(err) => {
                    tracing::warn!(kind = err.kind(), error = %err, "query ended with error");
                    QueryEvent::error(err)
                }
            };

            if let Some(archive) = archive {
                if archive.send(conversation.into_messages()).is_err() {
                    tracing::debug!("archive receiver dropped");
                }
            }
            yield terminal;
        })
    }
}

fn build_request(
    config: &EngineConfig,
    provider: &SharedAdapter,
    conversation: &Conversation,
    snapshot: &ToolSnapshot,
) -> CompletionRequest {
    let model = config
        .model
        .clone()
        .unwrap_or_else(|| provider.model().to_string());
    let tools = snapshot
        .available()
        .map(|tool| {
            ToolDefinition::new(
                &tool.qualified_name,
                tool.description.clone().unwrap_or_default(),
                tool.input_schema.clone(),
            )
        })
        .collect();

    let mut request = CompletionRequest::new(model, conversation.messages().to_vec(), config.max_tokens)
        .with_tools(tools);
    if let Some(system) = &config.system_prompt {
        request = request.with_system(system);
    }
    if let Some(temperature) = config.temperature {
        request = request.with_temperature(temperature);
    }
    request
}

/// Run every call of one round. Results come back in request order.
async fn dispatch_all(
    registry: &ToolRegistry,
    calls: &[ToolCallRequest],
    config: &EngineConfig,
) -> Vec<Result<String>> {
    if config.parallel_tools {
        join_all(calls.iter().map(|call| dispatch(registry, call, config.tool_timeout))).await
    } else {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(dispatch(registry, call, config.tool_timeout).await);
        }
        results
    }
}

async fn dispatch(registry: &ToolRegistry, call: &ToolCallRequest, limit: Duration) -> Result<String> {
    let arguments = match &call.arguments {
        Value::Object(_) => Some(call.arguments.clone()),
        Value::Null => None,
        Value::String(raw) => {
            return Err(EngineError::tool_invocation(
                &call.name,
                format!("arguments are not valid JSON: {raw}"),
            ));
        }
        other => {
            return Err(EngineError::tool_invocation(
                &call.name,
                format!("arguments must be an object, got {other}"),
            ));
        }
    };

    tracing::debug!(tool = %call.name, id = %call.id, "dispatching tool");
    match timeout(limit, registry.invoke(&call.name, arguments)).await {
        Err(_) => Err(EngineError::tool_timeout(&call.name, limit)),
        Ok(Err(err)) => Err(EngineError::from_tool_error(&call.name, err)),
        Ok(Ok(result)) => Ok(result.render_text()),
    }
}
