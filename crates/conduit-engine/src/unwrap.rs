//! Rules for reducing structured model output to plain text.
//!
//! Models asked for prose sometimes answer with a JSON envelope such as
//! `{"joke": "..."}`. These rules decide which envelopes are really text,
//! and which objects are tool-call directives written inline as text.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Configurable envelope rules used by [`ChunkDecoder`](crate::ChunkDecoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnwrapRules {
    /// Keys whose value is the text the model meant to say.
    pub text_keys: Vec<String>,
    /// Only unwrap objects with exactly one field.
    pub single_field: bool,
    /// Maximum envelope nesting that is unwrapped.
    pub max_depth: usize,
    /// Accept envelopes inside a ```` ```json ```` fence.
    pub strip_code_fences: bool,
    /// Keys naming the tool in an inline directive.
    pub name_keys: Vec<String>,
    /// Keys carrying the arguments of an inline directive.
    pub argument_keys: Vec<String>,
}

impl Default for UnwrapRules {
    fn default() -> Self {
        Self {
            text_keys: [
                "text", "content", "message", "answer", "response", "output", "result", "joke",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            single_field: true,
            max_depth: 5,
            strip_code_fences: true,
            name_keys: vec!["name".into(), "tool".into()],
            argument_keys: vec!["arguments".into(), "parameters".into(), "input".into()],
        }
    }
}

impl UnwrapRules {
    /// Rules that never unwrap anything.
    pub fn disabled() -> Self {
        Self {
            text_keys: Vec::new(),
            strip_code_fences: false,
            name_keys: Vec::new(),
            argument_keys: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_text_key(mut self, key: impl Into<String>) -> Self {
        self.text_keys.push(key.into());
        self
    }

    pub fn with_single_field(mut self, single_field: bool) -> Self {
        self.single_field = single_field;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn is_text_key(&self, key: &str) -> bool {
        self.text_keys.iter().any(|k| k.eq_ignore_ascii_case(key))
    }

    /// The text a complete envelope stands for, if it is one.
    pub fn reduce(&self, value: &Value) -> Option<String> {
        self.reduce_at(value, 0)
    }

    fn reduce_at(&self, value: &Value, depth: usize) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) if depth < self.max_depth => {
                if self.single_field && map.len() != 1 {
                    return None;
                }
                let inner = self.text_field(map)?;
                match inner {
                    Value::Number(_) | Value::Bool(_) => Some(inner.to_string()),
                    _ => self.reduce_at(inner, depth + 1),
                }
            }
            _ => None,
        }
    }

    fn text_field<'a>(&self, map: &'a Map<String, Value>) -> Option<&'a Value> {
        self.text_keys.iter().find_map(|key| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }

    /// Split an inline tool-call directive into `(name, arguments)`.
    ///
    /// Whether the name refers to a real tool is the caller's decision.
    /// Arguments given as a JSON string are parsed; unparseable strings are
    /// kept as `Value::String`.
    pub fn directive(&self, value: &Value) -> Option<(String, Value)> {
        let map = value.as_object()?;
        let name = self
            .name_keys
            .iter()
            .find_map(|k| map.get(k.as_str()).and_then(Value::as_str))?;

        let arguments = match self.argument_keys.iter().find_map(|k| map.get(k.as_str())) {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(Value::String(raw)) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
            Some(other) => other.clone(),
        };
        Some((name.to_string(), arguments))
    }

    /// Best-effort text of an envelope cut off mid-stream.
    ///
    /// `{"answer": "Forty-tw` yields `Forty-tw`. Returns `None` when the
    /// prefix does not start a text envelope.
    pub fn partial_text(&self, raw: &str) -> Option<String> {
        self.partial_at(raw.trim_start(), 0)
    }

    fn partial_at(&self, s: &str, depth: usize) -> Option<String> {
        if depth >= self.max_depth {
            return None;
        }
        let s = s.strip_prefix('{')?.trim_start();
        let (key, rest) = split_string(s)?;
        if !self.is_text_key(&key) {
            return None;
        }
        let rest = rest.trim_start().strip_prefix(':')?.trim_start();
        if rest.starts_with('{') {
            return self.partial_at(rest, depth + 1);
        }
        let (text, after) = unescape_partial(rest.strip_prefix('"')?);
        if let Some(after) = after {
            if self.single_field && after.trim_start().starts_with(',') {
                return None;
            }
        }
        Some(text)
    }
}

/// Index of the first unescaped `"` in `s`.
fn closing_quote(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(i),
            _ => {}
        }
    }
    None
}

/// Parse a complete JSON string literal at the start of `s`.
fn split_string(s: &str) -> Option<(String, &str)> {
    let body = s.strip_prefix('"')?;
    let end = closing_quote(body)?;
    let literal = &s[..end + 2];
    let key = serde_json::from_str::<String>(literal).ok()?;
    Some((key, &s[end + 2..]))
}

/// Decode the body of a string literal that may be unterminated.
///
/// Returns the text and, when the literal closed, whatever followed it.
fn unescape_partial(body: &str) -> (String, Option<&str>) {
    if let Some(end) = closing_quote(body) {
        let literal = format!("\"{}\"", &body[..end]);
        let text = serde_json::from_str::<String>(&literal).unwrap_or_else(|_| body[..end].into());
        return (text, Some(&body[end + 1..]));
    }

    // Drop a dangling escape (`\`, `\u00`) from the cut-off end.
    let mut cut = body.len();
    for _ in 0..6 {
        if let Ok(text) = serde_json::from_str::<String>(&format!("\"{}\"", &body[..cut])) {
            return (text, None);
        }
        match body[..cut].char_indices().next_back() {
            Some((i, _)) => cut = i,
            None => break,
        }
    }
    (body.to_string(), None)
}
