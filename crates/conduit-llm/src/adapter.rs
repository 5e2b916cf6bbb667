//! The provider adapter trait and its raw event stream.
//!
//! An adapter opens one streaming completion and yields provider events in
//! a common shape. It never interprets text: detecting structured output,
//! unwrapping envelopes and assembling tool calls is the decoder's job.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::types::{CompletionRequest, StopReason, Usage};

// ─────────────────────────────────────────────────────────────────────────────
// Shared Retry Logic
// ─────────────────────────────────────────────────────────────────────────────

/// Execute an async operation with exponential backoff retry.
///
/// Retries only on transient errors (network failures, rate limits). A
/// provider-supplied `Retry-After` replaces the computed backoff.
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    adapter_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = initial_backoff;
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                let delay = e.retry_after().unwrap_or(backoff);
                tracing::warn!(
                    adapter = adapter_name,
                    attempt,
                    max_retries,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming Types
// ─────────────────────────────────────────────────────────────────────────────

/// A streaming response from a provider.
pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<RawEvent>> + Send + 'static>>;

/// Events emitted by a provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// Message started.
    MessageStart { id: String, model: String },
    /// Content block started.
    ContentBlockStart { index: usize, block: BlockStart },
    /// Incremental content within a block.
    ContentBlockDelta { index: usize, delta: ContentDelta },
    /// Content block finished.
    ContentBlockStop { index: usize },
    /// Message finished with final usage stats.
    MessageDelta {
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Message complete.
    MessageStop,
    /// Ping to keep connection alive.
    Ping,
    /// The provider reported an error mid-stream.
    Error { message: String },
}

/// The kind of a content block, known when it opens.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockStart {
    Text,
    ToolUse { id: String, name: String },
}

/// Delta content in a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentDelta {
    /// Text being streamed.
    TextDelta(String),
    /// Partial JSON for tool input.
    InputJsonDelta(String),
}

impl RawEvent {
    pub fn text_delta(index: usize, text: impl Into<String>) -> Self {
        RawEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::TextDelta(text.into()),
        }
    }

    pub fn input_json_delta(index: usize, json: impl Into<String>) -> Self {
        RawEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::InputJsonDelta(json.into()),
        }
    }

    pub fn text_start(index: usize) -> Self {
        RawEvent::ContentBlockStart {
            index,
            block: BlockStart::Text,
        }
    }

    pub fn tool_use_start(index: usize, id: impl Into<String>, name: impl Into<String>) -> Self {
        RawEvent::ContentBlockStart {
            index,
            block: BlockStart::ToolUse {
                id: id.into(),
                name: name.into(),
            },
        }
    }

    /// Returns true if this is an error event.
    pub fn is_error(&self) -> bool {
        matches!(self, RawEvent::Error { .. })
    }

    /// Returns true if this is the final event in a message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RawEvent::MessageStop | RawEvent::Error { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider Adapter Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A streaming LLM provider.
///
/// Implementations translate a [`CompletionRequest`] into the provider's
/// wire format and its streamed reply into [`RawEvent`]s. Only opening the
/// stream may be retried; once events flow, failures surface as stream
/// items.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Open a streaming completion.
    async fn stream(&self, request: CompletionRequest) -> Result<RawEventStream>;

    /// Get the name of this adapter.
    fn name(&self) -> &str;

    /// Model used when a request does not name one.
    fn model(&self) -> &str;
}

/// An adapter that can be shared across threads.
pub type SharedAdapter = Arc<dyn ProviderAdapter>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock Adapter
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(any(test, feature = "testing"))]
pub use mock::{MockAdapter, MockTurn};

#[cfg(any(test, feature = "testing"))]
mod mock {
    use super::*;
    use crate::error::LlmError;
    use std::sync::Mutex;

    /// One scripted provider turn.
    #[derive(Debug, Clone)]
    pub enum MockTurn {
        /// Replay these events, each optionally preceded by a delay.
        Events {
            events: Vec<std::result::Result<RawEvent, String>>,
            delay: Option<Duration>,
        },
        /// Fail to open the stream.
        OpenError(String),
        /// Open the stream but never produce an event.
        Hang,
    }

    impl MockTurn {
        /// A turn that replays `events` without pauses.
        pub fn events(events: Vec<RawEvent>) -> Self {
            MockTurn::Events {
                events: events.into_iter().map(Ok).collect(),
                delay: None,
            }
        }

        /// A complete text reply, streamed as one delta per fragment.
        pub fn text(fragments: &[&str]) -> Self {
            let mut events = vec![
                RawEvent::MessageStart {
                    id: "mock_msg".to_string(),
                    model: "mock-model".to_string(),
                },
                RawEvent::text_start(0),
            ];
            events.extend(fragments.iter().map(|f| RawEvent::text_delta(0, *f)));
            events.extend([
                RawEvent::ContentBlockStop { index: 0 },
                RawEvent::MessageDelta {
                    stop_reason: StopReason::EndTurn,
                    usage: Usage::new(10, 20),
                },
                RawEvent::MessageStop,
            ]);
            Self::events(events)
        }

        /// A reply that requests one native tool call per `(id, name, json)`.
        pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Self {
            let mut events = vec![RawEvent::MessageStart {
                id: "mock_msg".to_string(),
                model: "mock-model".to_string(),
            }];
            for (index, (id, name, json)) in calls.iter().enumerate() {
                events.push(RawEvent::tool_use_start(index, *id, *name));
                events.push(RawEvent::input_json_delta(index, *json));
                events.push(RawEvent::ContentBlockStop { index });
            }
            events.extend([
                RawEvent::MessageDelta {
                    stop_reason: StopReason::ToolUse,
                    usage: Usage::new(10, 20),
                },
                RawEvent::MessageStop,
            ]);
            Self::events(events)
        }

        /// Pause between events.
        pub fn with_delay(self, pause: Duration) -> Self {
            match self {
                MockTurn::Events { events, .. } => MockTurn::Events {
                    events,
                    delay: Some(pause),
                },
                other => other,
            }
        }

        /// Append a transport error after the scripted events.
        pub fn then_fail(self, message: impl Into<String>) -> Self {
            match self {
                MockTurn::Events { mut events, delay } => {
                    events.push(Err(message.into()));
                    MockTurn::Events { events, delay }
                }
                other => other,
            }
        }
    }

    /// A scripted adapter for tests.
    ///
    /// Each call to [`stream`](ProviderAdapter::stream) consumes the next
    /// turn and records the request it was given.
    #[derive(Debug)]
    pub struct MockAdapter {
        model: String,
        turns: Mutex<Vec<MockTurn>>,
        request_log: Mutex<Vec<CompletionRequest>>,
    }

    impl MockAdapter {
        pub fn new(turns: Vec<MockTurn>) -> Self {
            Self {
                model: "mock-model".to_string(),
                turns: Mutex::new(turns),
                request_log: Mutex::new(Vec::new()),
            }
        }

        /// A mock with a single text reply.
        pub fn with_text(text: impl Into<String>) -> Self {
            let text = text.into();
            Self::new(vec![MockTurn::text(&[text.as_str()])])
        }

        /// All requests that were made to this adapter.
        pub fn requests(&self) -> Vec<CompletionRequest> {
            self.request_log.lock().unwrap().clone()
        }

        /// The number of requests made.
        pub fn request_count(&self) -> usize {
            self.request_log.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockAdapter {
        async fn stream(&self, request: CompletionRequest) -> Result<RawEventStream> {
            self.request_log.lock().unwrap().push(request);

            let turn = {
                let mut turns = self.turns.lock().unwrap();
                if turns.is_empty() {
                    return Err(LlmError::Backend(
                        "MockAdapter: no more turns available".to_string(),
                    ));
                }
                turns.remove(0)
            };

            match turn {
                MockTurn::OpenError(message) => Err(LlmError::Backend(message)),
                MockTurn::Hang => Ok(Box::pin(futures::stream::pending())),
                MockTurn::Events { events, delay } => Ok(Box::pin(replay(events, delay))),
            }
        }

        fn name(&self) -> &str {
            "mock"
        }

        fn model(&self) -> &str {
            &self.model
        }
    }

    fn replay(
        events: Vec<std::result::Result<RawEvent, String>>,
        delay: Option<Duration>,
    ) -> impl Stream<Item = Result<RawEvent>> + Send + 'static {
        futures::stream::unfold(events.into_iter(), move |mut events| async move {
            let next = events.next()?;
            if let Some(pause) = delay {
                tokio::time::sleep(pause).await;
            }
            Some((next.map_err(LlmError::Network), events))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::types::Message;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn request() -> CompletionRequest {
        CompletionRequest::new("test-model", vec![Message::user("Hi")], 100)
    }

    #[tokio::test]
    async fn test_mock_adapter_replays_turns_in_order() {
        let adapter = MockAdapter::new(vec![MockTurn::text(&["First"]), MockTurn::text(&["Second"])]);

        for expected in ["First", "Second"] {
            let events: Vec<_> = adapter
                .stream(request())
                .await
                .unwrap()
                .map(|e| e.unwrap())
                .collect()
                .await;
            assert!(events.contains(&RawEvent::text_delta(0, expected)));
            assert_eq!(events.last(), Some(&RawEvent::MessageStop));
        }
        assert_eq!(adapter.request_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_adapter_exhausted() {
        let adapter = MockAdapter::new(vec![]);
        assert!(adapter.stream(request()).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_adapter_stream_failure() {
        let adapter = MockAdapter::new(vec![MockTurn::text(&["partial"]).then_fail("reset")]);
        let results: Vec<_> = adapter.stream(request()).await.unwrap().collect().await;
        assert!(matches!(results.last(), Some(Err(LlmError::Network(_)))));
    }

    #[tokio::test]
    async fn test_mock_adapter_tool_calls_script() {
        let adapter = MockAdapter::new(vec![MockTurn::tool_calls(&[(
            "t1",
            "db__query",
            r#"{"sql":"SELECT 1"}"#,
        )])]);
        let events: Vec<_> = adapter
            .stream(request())
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(events[1], RawEvent::tool_use_start(0, "t1", "db__query"));
        assert!(events.contains(&RawEvent::MessageDelta {
            stop_reason: StopReason::ToolUse,
            usage: Usage::new(10, 20),
        }));
    }

    #[tokio::test]
    async fn test_with_retry_retries_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(3, Duration::from_millis(1), "test", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LlmError::Network("flaky".to_string()))
            } else {
                Ok("opened")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "opened");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_max() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(2, Duration::from_millis(1), "test", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::Network("down".to_string()))
        })
        .await;

        assert!(matches!(result, Err(LlmError::Network(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_auth() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(3, Duration::from_millis(1), "test", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::Auth("bad key".to_string()))
        })
        .await;

        assert!(matches!(result, Err(LlmError::Auth(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_raw_event_predicates() {
        assert!(RawEvent::Error { message: "oops".to_string() }.is_error());
        assert!(RawEvent::MessageStop.is_terminal());
        assert!(!RawEvent::Ping.is_terminal());
        assert!(!RawEvent::ContentBlockStop { index: 0 }.is_terminal());
    }
}
