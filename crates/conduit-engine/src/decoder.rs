//! Streaming decoder from raw provider events to text and tool calls.
//!
//! One [`ChunkDecoder`] lives for exactly one provider stream. Text blocks
//! are sniffed at their start: prose passes straight through, while a block
//! that opens with `{` (or a ```` ```json ```` fence) is buffered until the
//! [`JsonScanner`] sees the object close. The complete object is then either
//! a tool-call directive, a text envelope that is unwrapped, or, as a last
//! resort, forwarded as its serialization.
//!
//! Native tool-use blocks are buffered per block index and emitted when the
//! block stops.

use std::collections::{BTreeMap, HashMap, HashSet};

use conduit_llm::{BlockStart, ContentDelta, RawEvent};
use serde_json::{Map, Value};

use crate::unwrap::UnwrapRules;

// ─────────────────────────────────────────────────────────────────────────────
// Decoded events
// ─────────────────────────────────────────────────────────────────────────────

/// A tool call requested by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Correlation id, echoed back with the tool result.
    pub id: String,
    /// Qualified tool name.
    pub name: String,
    /// Arguments. A `Value::String` here holds arguments that failed to parse.
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Whether the arguments could not be parsed as JSON.
    pub fn has_malformed_arguments(&self) -> bool {
        self.arguments.is_string()
    }
}

/// Output of the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Text(String),
    ToolCall(ToolCallRequest),
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON scanner
// ─────────────────────────────────────────────────────────────────────────────

/// Resumable bracket tracker for a JSON value arriving in pieces.
///
/// It does not validate; it only finds where the top-level value ends,
/// which is enough to know when to hand the buffer to `serde_json`.
#[derive(Debug, Clone, Default)]
pub struct JsonScanner {
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one character. Returns `true` when it closes the top-level value.
    pub fn push(&mut self, c: char) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == '"' {
                self.in_string = false;
            }
            return false;
        }
        match c {
            '"' => self.in_string = true,
            '{' | '[' => self.depth += 1,
            '}' | ']' => {
                self.depth = self.depth.saturating_sub(1);
                return self.depth == 0;
            }
            _ => {}
        }
        false
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn in_string(&self) -> bool {
        self.in_string
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-block state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum TextState {
    /// Start of a block (or just after a structured unit); not yet decided.
    Sniffing(String),
    /// Prose; deltas pass straight through.
    Plain,
    /// Buffering one JSON object.
    Structured {
        prefix: String,
        buf: String,
        scanner: JsonScanner,
        fenced: bool,
    },
    /// A fenced object closed; swallowing the closing fence.
    ClosingFence(String),
}

impl Default for TextState {
    fn default() -> Self {
        TextState::Sniffing(String::new())
    }
}

enum Sniff {
    Undecided,
    Plain,
    Object { body_start: usize, fenced: bool },
}

fn sniff(buf: &str, strip_fences: bool) -> Sniff {
    let trimmed = buf.trim_start();
    if trimmed.is_empty() {
        return Sniff::Undecided;
    }
    let lead = buf.len() - trimmed.len();
    if trimmed.starts_with('{') {
        return Sniff::Object {
            body_start: lead,
            fenced: false,
        };
    }
    if !strip_fences || !trimmed.starts_with('`') {
        return Sniff::Plain;
    }

    let Some(after) = trimmed.strip_prefix("```") else {
        return if "```".starts_with(trimmed) {
            Sniff::Undecided
        } else {
            Sniff::Plain
        };
    };
    let Some(newline) = after.find('\n') else {
        let info = after.trim_end().to_ascii_lowercase();
        return if "json".starts_with(&info) {
            Sniff::Undecided
        } else {
            Sniff::Plain
        };
    };
    let info = after[..newline].trim();
    if !(info.is_empty() || info.eq_ignore_ascii_case("json")) {
        return Sniff::Plain;
    }
    let body = after[newline + 1..].trim_start();
    if body.is_empty() {
        Sniff::Undecided
    } else if body.starts_with('{') {
        Sniff::Object {
            body_start: buf.len() - body.len(),
            fenced: true,
        }
    } else {
        Sniff::Plain
    }
}

#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    json: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolver
// ─────────────────────────────────────────────────────────────────────────────

/// Decides what a complete structured unit means.
#[derive(Debug)]
struct Resolver {
    rules: UnwrapRules,
    /// Accepted directive names, mapped to the qualified tool name.
    tools: HashMap<String, String>,
    fallbacks: usize,
}

impl Resolver {
    /// Returns `false` when the unit was not valid JSON and went out verbatim.
    fn resolve(&mut self, prefix: &str, raw: &str, out: &mut Vec<DecodedEvent>) -> bool {
        let value = match serde_json::from_str::<Value>(raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, "structured text did not parse, forwarding verbatim");
                out.push(DecodedEvent::Text(format!("{prefix}{raw}")));
                return false;
            }
        };

        if let Some((name, arguments)) = self.rules.directive(&value) {
            if let Some(qualified) = self.tools.get(&name) {
                tracing::debug!(tool = %qualified, "inline tool directive");
                out.push(DecodedEvent::ToolCall(ToolCallRequest::new(
                    new_call_id(),
                    qualified.clone(),
                    arguments,
                )));
                return true;
            }
        }

        if let Some(text) = self.rules.reduce(&value) {
            if !text.is_empty() {
                out.push(DecodedEvent::Text(text));
            }
            return true;
        }

        self.fallbacks += 1;
        tracing::warn!(
            event = "DecodeFallbackUsed",
            fallbacks = self.fallbacks,
            "structured output could not be reduced to text, forwarding its serialization"
        );
        out.push(DecodedEvent::Text(value.to_string()));
        true
    }

    fn step(
        &mut self,
        state: TextState,
        input: String,
        out: &mut Vec<DecodedEvent>,
    ) -> (TextState, String) {
        match state {
            TextState::Plain => {
                out.push(DecodedEvent::Text(input));
                (TextState::Plain, String::new())
            }
            TextState::Sniffing(mut buf) => {
                buf.push_str(&input);
                match sniff(&buf, self.rules.strip_code_fences) {
                    Sniff::Undecided => (TextState::Sniffing(buf), String::new()),
                    Sniff::Plain => {
                        out.push(DecodedEvent::Text(buf));
                        (TextState::Plain, String::new())
                    }
                    Sniff::Object { body_start, fenced } => {
                        let body = buf.split_off(body_start);
                        let state = TextState::Structured {
                            prefix: buf,
                            buf: String::new(),
                            scanner: JsonScanner::new(),
                            fenced,
                        };
                        (state, body)
                    }
                }
            }
            TextState::Structured {
                prefix,
                mut buf,
                mut scanner,
                fenced,
            } => {
                for (i, c) in input.char_indices() {
                    buf.push(c);
                    if scanner.push(c) {
                        let rest = input[i + c.len_utf8()..].to_string();
                        let decoded = self.resolve(&prefix, &buf, out);
                        let next = if fenced && decoded {
                            TextState::ClosingFence(String::new())
                        } else {
                            TextState::default()
                        };
                        return (next, rest);
                    }
                }
                let state = TextState::Structured {
                    prefix,
                    buf,
                    scanner,
                    fenced,
                };
                (state, String::new())
            }
            TextState::ClosingFence(mut buf) => {
                buf.push_str(&input);
                let trimmed = buf.trim_start();
                if let Some(rest) = trimmed.strip_prefix("```") {
                    (TextState::default(), rest.to_string())
                } else if trimmed.is_empty() || "```".starts_with(trimmed) {
                    (TextState::ClosingFence(buf), String::new())
                } else {
                    (TextState::default(), buf)
                }
            }
        }
    }

    fn feed(&mut self, mut state: TextState, text: &str, out: &mut Vec<DecodedEvent>) -> TextState {
        let mut pending = text.to_string();
        while !pending.is_empty() {
            let (next, rest) = self.step(state, pending, out);
            state = next;
            pending = rest;
        }
        state
    }

    fn flush(&mut self, state: TextState, out: &mut Vec<DecodedEvent>) {
        match state {
            TextState::Plain => {}
            TextState::Sniffing(buf) => {
                if !buf.is_empty() {
                    out.push(DecodedEvent::Text(buf));
                }
            }
            TextState::Structured { prefix, buf, .. } => match self.rules.partial_text(&buf) {
                Some(text) => {
                    tracing::debug!("stream ended inside a text envelope, keeping partial text");
                    if !text.is_empty() {
                        out.push(DecodedEvent::Text(text));
                    }
                }
                None => {
                    tracing::debug!("stream ended inside structured text, flushing verbatim");
                    out.push(DecodedEvent::Text(format!("{prefix}{buf}")));
                }
            },
            TextState::ClosingFence(buf) => {
                let trimmed = buf.trim();
                if !trimmed.is_empty() && !"```".starts_with(trimmed) {
                    out.push(DecodedEvent::Text(buf));
                }
            }
        }
    }
}

fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

// ─────────────────────────────────────────────────────────────────────────────
// Chunk decoder
// ─────────────────────────────────────────────────────────────────────────────

/// Stateful decoder for one provider stream.
///
/// Call [`decode`](Self::decode) once per raw event in arrival order, then
/// [`finish`](Self::finish) when the stream ends for any reason.
#[derive(Debug)]
pub struct ChunkDecoder {
    resolver: Resolver,
    text: BTreeMap<usize, TextState>,
    tools: BTreeMap<usize, PendingToolUse>,
}

impl ChunkDecoder {
    pub fn new(rules: UnwrapRules) -> Self {
        Self {
            resolver: Resolver {
                rules,
                tools: HashMap::new(),
                fallbacks: 0,
            },
            text: BTreeMap::new(),
            tools: BTreeMap::new(),
        }
    }

    /// Tools that inline text directives may name, as `(qualified, local)`
    /// pairs. A local name is accepted only when no other tool shares it.
    pub fn with_tools<I, Q, L>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = (Q, L)>,
        Q: Into<String>,
        L: Into<String>,
    {
        let mut locals: HashMap<String, String> = HashMap::new();
        let mut ambiguous = HashSet::new();
        for (qualified, local) in tools {
            let qualified = qualified.into();
            let local = local.into();
            if locals.insert(local.clone(), qualified.clone()).is_some() {
                ambiguous.insert(local);
            }
            self.resolver.tools.insert(qualified.clone(), qualified);
        }
        for (local, qualified) in locals {
            if !ambiguous.contains(&local) {
                self.resolver.tools.entry(local).or_insert(qualified);
            }
        }
        self
    }

    /// Number of last-resort serializations so far.
    pub fn fallback_count(&self) -> usize {
        self.resolver.fallbacks
    }

    /// Decode one raw event.
    pub fn decode(&mut self, event: RawEvent) -> Vec<DecodedEvent> {
        let mut out = Vec::new();
        match event {
            RawEvent::ContentBlockStart { index, block } => match block {
                BlockStart::Text => {
                    self.text.entry(index).or_default();
                }
                BlockStart::ToolUse { id, name } => {
                    self.tools.insert(
                        index,
                        PendingToolUse {
                            id,
                            name,
                            json: String::new(),
                        },
                    );
                }
            },
            RawEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta(text) => {
                    let state = self.text.remove(&index).unwrap_or_default();
                    let state = self.resolver.feed(state, &text, &mut out);
                    self.text.insert(index, state);
                }
                ContentDelta::InputJsonDelta(json) => match self.tools.get_mut(&index) {
                    Some(pending) => pending.json.push_str(&json),
                    None => tracing::warn!(index, "input delta for unknown tool block, ignoring"),
                },
            },
            RawEvent::ContentBlockStop { index } => {
                if let Some(state) = self.text.remove(&index) {
                    self.resolver.flush(state, &mut out);
                }
                if let Some(pending) = self.tools.remove(&index) {
                    out.push(DecodedEvent::ToolCall(complete_tool_use(pending)));
                }
            }
            RawEvent::MessageStop => self.drain(&mut out),
            RawEvent::MessageStart { .. }
            | RawEvent::MessageDelta { .. }
            | RawEvent::Ping
            | RawEvent::Error { .. } => {}
        }
        out
    }

    /// Flush everything still buffered. Safe to call more than once.
    pub fn finish(&mut self) -> Vec<DecodedEvent> {
        let mut out = Vec::new();
        self.drain(&mut out);
        out
    }

    fn drain(&mut self, out: &mut Vec<DecodedEvent>) {
        for (_, state) in std::mem::take(&mut self.text) {
            self.resolver.flush(state, out);
        }
        for (_, pending) in std::mem::take(&mut self.tools) {
            out.push(DecodedEvent::ToolCall(complete_tool_use(pending)));
        }
    }
}

fn complete_tool_use(pending: PendingToolUse) -> ToolCallRequest {
    let arguments = if pending.json.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        match serde_json::from_str::<Value>(&pending.json) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    tool = %pending.name,
                    error = %e,
                    "tool arguments are not valid JSON"
                );
                Value::String(pending.json)
            }
        }
    };
    ToolCallRequest::new(pending.id, pending.name, arguments)
}
