//! End-to-end query tests against a scripted provider and a stub tool server.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use conduit_engine::{EngineConfig, OrchestrationEngine, QueryEvent, QueryStream};
use conduit_llm::{
    ContentBlock, Message, MockAdapter, MockTurn, RawEvent, Role, StopReason, Usage,
};
use conduit_mcp::{CallToolResult, McpError, ToolConnection, ToolInfo, ToolRegistry};

// ─────────────────────────────────────────────────────────────────────────────
// Stub tool server
// ─────────────────────────────────────────────────────────────────────────────

/// In-process stand-in for an SQLite MCP server.
struct StubDb {
    alive: AtomicBool,
    calls: Mutex<Vec<(String, Option<Value>)>>,
    completed: AtomicUsize,
}

impl StubDb {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> Vec<(String, Option<Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolConnection for StubDb {
    fn server_name(&self) -> &str {
        "db"
    }

    async fn list_tools(&self) -> conduit_mcp::Result<Vec<ToolInfo>> {
        Ok(["query", "echo", "slow", "crash"]
            .into_iter()
            .map(|name| ToolInfo {
                name: name.to_string(),
                description: Some(format!("stub {name}")),
                input_schema: Some(json!({"type": "object"})),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> conduit_mcp::Result<CallToolResult> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        let result = match name {
            "query" => CallToolResult::text(r#"{"rows": [[1, "widget", 9.99]]}"#),
            "echo" => CallToolResult::text(arguments.unwrap_or(Value::Null).to_string()),
            "slow" => {
                let ms = arguments
                    .as_ref()
                    .and_then(|a| a["ms"].as_u64())
                    .unwrap_or(1_000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                CallToolResult::text(format!("slept {ms}ms"))
            }
            "crash" => {
                self.alive.store(false, Ordering::SeqCst);
                return Err(McpError::ConnectionClosed);
            }
            other => CallToolResult::error(format!("no such tool {other}")),
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(result)
    }

    async fn close(&self) -> conduit_mcp::Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

async fn registry_with(db: &Arc<StubDb>) -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::new());
    registry.add_connection(db.clone()).await.unwrap();
    registry
}

/// Drain a query stream, checking it ends with exactly one terminal event.
async fn collect(stream: QueryStream) -> Vec<QueryEvent> {
    let events: Vec<QueryEvent> = stream.collect().await;
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "expected one terminal event in {events:?}");
    assert!(events.last().is_some_and(QueryEvent::is_terminal));
    events
}

fn text_of(events: &[QueryEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            QueryEvent::Text { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

fn terminal(events: &[QueryEvent]) -> &QueryEvent {
    events.last().unwrap()
}

fn error_kind(events: &[QueryEvent]) -> Option<&str> {
    match terminal(events) {
        QueryEvent::Error { kind, .. } => Some(kind.as_str()),
        _ => None,
    }
}

fn tool_ends(events: &[QueryEvent]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            QueryEvent::ToolEnd { name, success, .. } => Some((name.clone(), *success)),
            _ => None,
        })
        .collect()
}

/// Tool results in a recorded request, as `(tool_use_id, content, is_error)`.
fn tool_results(messages: &[Message]) -> Vec<(String, String, bool)> {
    messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .flat_map(|m| m.content.blocks())
        .filter_map(|b| match b {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some((tool_use_id, content, is_error)),
            _ => None,
        })
        .collect()
}

/// A turn that says something and then calls one tool.
fn narrated_call(text: &str, id: &str, name: &str, json: &str) -> MockTurn {
    MockTurn::events(vec![
        RawEvent::text_start(0),
        RawEvent::text_delta(0, text),
        RawEvent::ContentBlockStop { index: 0 },
        RawEvent::tool_use_start(1, id, name),
        RawEvent::input_json_delta(1, json),
        RawEvent::ContentBlockStop { index: 1 },
        RawEvent::MessageDelta {
            stop_reason: StopReason::ToolUse,
            usage: Usage::new(5, 5),
        },
        RawEvent::MessageStop,
    ])
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_plain_answer_without_tools() {
    let provider = Arc::new(MockAdapter::new(vec![MockTurn::text(&[
        "Why do programmers prefer dark mode? ",
        "Because light attracts bugs.",
    ])]));
    let engine = OrchestrationEngine::builder()
        .provider(provider.clone())
        .build()
        .unwrap();

    let events = collect(engine.submit("Tell me a joke")).await;
    assert_eq!(
        text_of(&events),
        "Why do programmers prefer dark mode? Because light attracts bugs."
    );
    assert_eq!(terminal(&events), &QueryEvent::Done { rounds: 0 });

    let requests = provider.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].tools.is_empty());
    assert_eq!(requests[0].messages, vec![Message::user("Tell me a joke")]);
}

#[tokio::test]
async fn test_wrapped_joke_is_unwrapped() {
    let provider = Arc::new(MockAdapter::new(vec![MockTurn::text(&[
        "{\"jo",
        "ke\": \"I told my computer a joke",
        " about UDP. It didn't get it.\"}",
    ])]));
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .build()
        .unwrap();

    let events = collect(engine.submit("Tell me a joke")).await;
    let text = text_of(&events);
    assert_eq!(text, "I told my computer a joke about UDP. It didn't get it.");
    for wrapper in ['{', '}', '"'] {
        assert!(!text.contains(wrapper));
    }
}

#[tokio::test]
async fn test_single_tool_round() {
    let db = StubDb::new();
    let provider = Arc::new(MockAdapter::new(vec![
        MockTurn::tool_calls(&[("toolu_1", "db__query", r#"{"sql": "select * from products"}"#)]),
        MockTurn::text(&["There is one product: a widget for $9.99."]),
    ]));
    let engine = OrchestrationEngine::builder()
        .provider(provider.clone())
        .registry(registry_with(&db).await)
        .build()
        .unwrap();

    let events = collect(engine.submit("What products do we sell?")).await;

    assert!(matches!(
        &events[0],
        QueryEvent::ToolStart { name, arguments, .. }
            if name == "db__query" && arguments["sql"] == "select * from products"
    ));
    assert_eq!(tool_ends(&events), vec![("db__query".to_string(), true)]);
    assert_eq!(text_of(&events), "There is one product: a widget for $9.99.");
    assert!(!text_of(&events).contains("rows"));
    assert_eq!(terminal(&events), &QueryEvent::Done { rounds: 1 });

    assert_eq!(
        db.calls(),
        vec![(
            "query".to_string(),
            Some(json!({"sql": "select * from products"}))
        )]
    );

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.len(), 4);
    assert!(requests[0].tools.iter().any(|t| t.name == "db__query"));

    let second = &requests[1].messages;
    assert_eq!(second.len(), 3);
    assert_eq!(second[1].role, Role::Assistant);
    let results = tool_results(second);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "toolu_1");
    assert!(results[0].1.contains("widget"));
    assert!(!results[0].2);
}

#[tokio::test]
async fn test_connection_lost_is_reported_to_provider() {
    let db = StubDb::new();
    let provider = Arc::new(MockAdapter::new(vec![
        MockTurn::tool_calls(&[("toolu_1", "db__crash", "{}")]),
        MockTurn::text(&["Sorry, the database is unavailable right now."]),
    ]));
    let engine = OrchestrationEngine::builder()
        .provider(provider.clone())
        .registry(registry_with(&db).await)
        .build()
        .unwrap();

    let events = collect(engine.submit("How many orders?")).await;
    assert_eq!(tool_ends(&events), vec![("db__crash".to_string(), false)]);
    assert_eq!(
        text_of(&events),
        "Sorry, the database is unavailable right now."
    );
    assert_eq!(terminal(&events), &QueryEvent::Done { rounds: 1 });

    let requests = provider.requests();
    let results = tool_results(&requests[1].messages);
    assert_eq!(results.len(), 1);
    assert!(results[0].2);
    assert!(results[0].1.contains("lost"), "{}", results[0].1);

    // The dead server's tools are no longer offered to the model.
    assert_eq!(requests[0].tools.len(), 4);
    assert!(requests[1].tools.is_empty());
}

#[tokio::test]
async fn test_round_limit_truncates() {
    let db = StubDb::new();
    let turns = (0..11)
        .map(|i| narrated_call(&format!("step {i}. "), &format!("toolu_{i}"), "db__echo", "{}"))
        .collect();
    let provider = Arc::new(MockAdapter::new(turns));
    let engine = OrchestrationEngine::builder()
        .provider(provider.clone())
        .registry(registry_with(&db).await)
        .config(EngineConfig::default().with_max_rounds(10))
        .build()
        .unwrap();

    let events = collect(engine.submit("loop forever")).await;
    assert_eq!(error_kind(&events), Some("truncated"));
    assert_eq!(provider.request_count(), 11);
    assert_eq!(db.calls().len(), 10);
    let text = text_of(&events);
    assert!(text.starts_with("step 0. step 1. "));
    assert!(text.ends_with("step 10. "));
}

#[tokio::test]
async fn test_unknown_tool_is_recoverable() {
    let provider = Arc::new(MockAdapter::new(vec![
        MockTurn::tool_calls(&[("toolu_1", "web__search", r#"{"q": "rust"}"#)]),
        MockTurn::text(&["I can't search the web."]),
    ]));
    let engine = OrchestrationEngine::builder()
        .provider(provider.clone())
        .build()
        .unwrap();

    let events = collect(engine.submit("search for rust")).await;
    assert_eq!(tool_ends(&events), vec![("web__search".to_string(), false)]);
    assert_eq!(terminal(&events), &QueryEvent::Done { rounds: 1 });

    let results = tool_results(&provider.requests()[1].messages);
    assert!(results[0].1.contains("unknown tool"));
}

#[tokio::test]
async fn test_malformed_arguments_are_not_dispatched() {
    let db = StubDb::new();
    let provider = Arc::new(MockAdapter::new(vec![
        MockTurn::tool_calls(&[("toolu_1", "db__query", r#"{"sql": "#)]),
        MockTurn::text(&["Let me try again later."]),
    ]));
    let engine = OrchestrationEngine::builder()
        .provider(provider.clone())
        .registry(registry_with(&db).await)
        .build()
        .unwrap();

    let events = collect(engine.submit("query")).await;
    assert_eq!(tool_ends(&events), vec![("db__query".to_string(), false)]);
    assert!(db.calls().is_empty());

    let second = &provider.requests()[1].messages;
    let results = tool_results(second);
    assert!(results[0].1.contains("not valid JSON"));
    assert!(matches!(
        &second[1].content.blocks()[0],
        ContentBlock::ToolUse { input, .. } if *input == json!({})
    ));
}

#[tokio::test]
async fn test_inline_directive_runs_tool() {
    let db = StubDb::new();
    let provider = Arc::new(MockAdapter::new(vec![
        MockTurn::text(&[r#"{"tool": "query", "arguments": {"sql": "select 1"}}"#]),
        MockTurn::text(&["The answer is 1."]),
    ]));
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .registry(registry_with(&db).await)
        .build()
        .unwrap();

    let events = collect(engine.submit("select one")).await;
    assert_eq!(tool_ends(&events), vec![("db__query".to_string(), true)]);
    assert_eq!(text_of(&events), "The answer is 1.");
    assert_eq!(db.calls()[0].1, Some(json!({"sql": "select 1"})));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_results_keep_request_order() {
    let db = StubDb::new();
    let provider = Arc::new(MockAdapter::new(vec![
        MockTurn::tool_calls(&[
            ("toolu_a", "db__slow", r#"{"ms": 300}"#),
            ("toolu_b", "db__slow", r#"{"ms": 100}"#),
            ("toolu_c", "db__echo", r#"{"x": 1}"#),
        ]),
        MockTurn::text(&["done"]),
    ]));
    let engine = OrchestrationEngine::builder()
        .provider(provider.clone())
        .registry(registry_with(&db).await)
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let events = collect(engine.submit("go")).await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
    assert_eq!(terminal(&events), &QueryEvent::Done { rounds: 1 });

    let results = tool_results(&provider.requests()[1].messages);
    let ids: Vec<&str> = results.iter().map(|r| r.0.as_str()).collect();
    assert_eq!(ids, vec!["toolu_a", "toolu_b", "toolu_c"]);
    assert_eq!(results[0].1, "slept 300ms");
    assert_eq!(results[2].1, r#"{"x":1}"#);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_dispatch_when_parallel_disabled() {
    let db = StubDb::new();
    let provider = Arc::new(MockAdapter::new(vec![
        MockTurn::tool_calls(&[
            ("toolu_a", "db__slow", r#"{"ms": 300}"#),
            ("toolu_b", "db__slow", r#"{"ms": 300}"#),
        ]),
        MockTurn::text(&["done"]),
    ]));
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .registry(registry_with(&db).await)
        .config(EngineConfig::default().with_parallel_tools(false))
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    collect(engine.submit("go")).await;
    assert!(started.elapsed() >= Duration::from_millis(600));
}

#[tokio::test]
async fn test_repeated_calls_are_independent() {
    let db = StubDb::new();
    let provider = Arc::new(MockAdapter::new(vec![
        MockTurn::tool_calls(&[
            ("toolu_1", "db__echo", r#"{"n": 7}"#),
            ("toolu_2", "db__echo", r#"{"n": 7}"#),
        ]),
        MockTurn::text(&["ok"]),
    ]));
    let engine = OrchestrationEngine::builder()
        .provider(provider.clone())
        .registry(registry_with(&db).await)
        .build()
        .unwrap();

    collect(engine.submit("twice")).await;
    let results = tool_results(&provider.requests()[1].messages);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].1, results[1].1);
    assert_ne!(results[0].0, results[1].0);
    assert_eq!(db.calls().len(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures, timeouts, cancellation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_provider_error_keeps_partial_output() {
    let provider = Arc::new(MockAdapter::new(vec![
        MockTurn::events(vec![
            RawEvent::text_start(0),
            RawEvent::text_delta(0, "The first half"),
        ])
        .then_fail("connection reset by peer"),
    ]));
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .build()
        .unwrap();

    let events = collect(engine.submit("explain")).await;
    assert_eq!(text_of(&events), "The first half");
    assert_eq!(error_kind(&events), Some("provider_error"));
}

#[tokio::test]
async fn test_mid_stream_error_event() {
    let provider = Arc::new(MockAdapter::new(vec![MockTurn::events(vec![
        RawEvent::text_start(0),
        RawEvent::text_delta(0, "Partial"),
        RawEvent::Error {
            message: "overloaded".to_string(),
        },
        RawEvent::text_delta(0, " never seen"),
    ])]));
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .build()
        .unwrap();

    let events = collect(engine.submit("explain")).await;
    assert_eq!(text_of(&events), "Partial");
    match terminal(&events) {
        QueryEvent::Error { kind, message } => {
            assert_eq!(kind, "provider_error");
            assert!(message.contains("overloaded"));
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_ending_before_message_stop_is_an_error() {
    let provider = Arc::new(MockAdapter::new(vec![MockTurn::events(vec![
        RawEvent::MessageStart {
            id: "msg_cut".to_string(),
            model: "mock-model".to_string(),
        },
        RawEvent::text_start(0),
        RawEvent::text_delta(0, "The answer is"),
    ])]));
    let (archive_tx, archive_rx) = oneshot::channel();
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .archive(archive_tx)
        .build()
        .unwrap();

    let events = collect(engine.submit("what is it?")).await;

    assert_eq!(text_of(&events), "The answer is");
    assert!(!events.iter().any(|e| matches!(e, QueryEvent::Done { .. })));
    match terminal(&events) {
        QueryEvent::Error { kind, message } => {
            assert_eq!(kind, "provider_error");
            assert!(message.contains("message_stop"));
        }
        other => panic!("expected error, got {other:?}"),
    }

    // The partial answer is still archived.
    let history = archive_rx.await.unwrap();
    assert_eq!(history.last().unwrap().text(), "The answer is");
}

#[tokio::test]
async fn test_open_failure_is_provider_error() {
    let provider = Arc::new(MockAdapter::new(vec![MockTurn::OpenError(
        "401 unauthorized".to_string(),
    )]));
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .build()
        .unwrap();

    let events = collect(engine.submit("hi")).await;
    assert_eq!(events.len(), 1);
    assert_eq!(error_kind(&events), Some("provider_error"));
}

#[tokio::test(start_paused = true)]
async fn test_provider_timeout() {
    let provider = Arc::new(MockAdapter::new(vec![MockTurn::Hang]));
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .config(EngineConfig::default().with_provider_timeout(Duration::from_secs(2)))
        .build()
        .unwrap();

    let events = collect(engine.submit("hi")).await;
    assert_eq!(error_kind(&events), Some("provider_timeout"));
}

#[tokio::test(start_paused = true)]
async fn test_provider_deadline_covers_whole_stream() {
    let provider = Arc::new(MockAdapter::new(vec![
        MockTurn::text(&["one ", "two ", "three ", "four"]).with_delay(Duration::from_millis(400)),
    ]));
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .config(EngineConfig::default().with_provider_timeout(Duration::from_millis(1500)))
        .build()
        .unwrap();

    let events = collect(engine.submit("count")).await;
    assert_eq!(text_of(&events), "one ");
    assert_eq!(error_kind(&events), Some("provider_timeout"));
}

#[tokio::test(start_paused = true)]
async fn test_tool_timeout_is_a_failed_result() {
    let db = StubDb::new();
    let provider = Arc::new(MockAdapter::new(vec![
        MockTurn::tool_calls(&[("toolu_1", "db__slow", r#"{"ms": 5000}"#)]),
        MockTurn::text(&["That took too long."]),
    ]));
    let engine = OrchestrationEngine::builder()
        .provider(provider.clone())
        .registry(registry_with(&db).await)
        .config(EngineConfig::default().with_tool_timeout(Duration::from_millis(100)))
        .build()
        .unwrap();

    let events = collect(engine.submit("be slow")).await;
    assert_eq!(tool_ends(&events), vec![("db__slow".to_string(), false)]);
    assert_eq!(terminal(&events), &QueryEvent::Done { rounds: 1 });
    let results = tool_results(&provider.requests()[1].messages);
    assert!(results[0].1.contains("timed out"));
    assert_eq!(db.completed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_token_ends_stream() {
    let provider = Arc::new(MockAdapter::new(vec![MockTurn::Hang]));
    let token = CancellationToken::new();
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .cancellation(token.clone())
        .build()
        .unwrap();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    let events = collect(engine.submit("hi")).await;
    canceller.await.unwrap();
    assert_eq!(error_kind(&events), Some("cancelled"));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_tools() {
    let db = StubDb::new();
    let provider = Arc::new(MockAdapter::new(vec![MockTurn::tool_calls(&[(
        "toolu_1",
        "db__slow",
        r#"{"ms": 10000}"#,
    )])]));
    let token = CancellationToken::new();
    let (tx, rx) = oneshot::channel();
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .registry(registry_with(&db).await)
        .cancellation(token.clone())
        .archive(tx)
        .build()
        .unwrap();

    let mut stream = engine.submit("hi");
    assert!(matches!(
        stream.next().await,
        Some(QueryEvent::ToolStart { .. })
    ));
    token.cancel();
    let rest: Vec<QueryEvent> = stream.collect().await;
    assert!(matches!(
        rest.as_slice(),
        [QueryEvent::Error { kind, .. }] if kind == "cancelled"
    ));

    let archived = rx.await.unwrap();
    let results = tool_results(&archived);
    assert_eq!(results, vec![("toolu_1".to_string(), "cancelled".to_string(), true)]);
    assert_eq!(db.completed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_stream_abandons_tool_call() {
    let db = StubDb::new();
    let provider = Arc::new(MockAdapter::new(vec![MockTurn::tool_calls(&[(
        "toolu_1",
        "db__slow",
        r#"{"ms": 1000}"#,
    )])]));
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .registry(registry_with(&db).await)
        .build()
        .unwrap();

    let mut stream = engine.submit("hi");
    assert!(matches!(
        stream.next().await,
        Some(QueryEvent::ToolStart { .. })
    ));
    // Poll once more so the tool call is in flight, then give up.
    let pending = tokio::time::timeout(Duration::from_millis(10), stream.next()).await;
    assert!(pending.is_err());
    drop(stream);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(db.calls().len(), 1);
    assert_eq!(db.completed.load(Ordering::SeqCst), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// History and archive
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_archive_receives_final_conversation() {
    let db = StubDb::new();
    let provider = Arc::new(MockAdapter::new(vec![
        MockTurn::tool_calls(&[("toolu_1", "db__query", "{}")]),
        MockTurn::text(&["One widget."]),
    ]));
    let (tx, rx) = oneshot::channel();
    let engine = OrchestrationEngine::builder()
        .provider(provider)
        .registry(registry_with(&db).await)
        .archive(tx)
        .build()
        .unwrap();

    collect(engine.submit("products?")).await;
    let archived = rx.await.unwrap();
    let roles: Vec<Role> = archived.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(archived[3].text(), "One widget.");
}

#[tokio::test]
async fn test_history_is_sent_with_new_query() {
    let provider = Arc::new(MockAdapter::with_text("Your name is Ada."));
    let history = vec![Message::user("My name is Ada."), Message::assistant("Hi Ada!")];
    let engine = OrchestrationEngine::builder()
        .provider(provider.clone())
        .history(history)
        .config(EngineConfig::default().with_system_prompt("You are terse."))
        .build()
        .unwrap();

    let events = collect(engine.submit("What is my name?")).await;
    assert_eq!(text_of(&events), "Your name is Ada.");

    let request = &provider.requests()[0];
    assert_eq!(request.messages.len(), 3);
    assert_eq!(request.messages[2], Message::user("What is my name?"));
    assert_eq!(request.system.as_deref(), Some("You are terse."));
}
