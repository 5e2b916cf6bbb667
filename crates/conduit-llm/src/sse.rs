//! Server-sent events framing shared by the HTTP adapters.
//!
//! Bytes are buffered until a full line is available, so multi-byte UTF-8
//! sequences split across network chunks decode correctly.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::adapter::{RawEvent, RawEventStream};
use crate::error::LlmError;

/// One parsed SSE line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SseField<'a> {
    Event(&'a str),
    Data(&'a str),
    /// Blank line; ends the current event.
    Boundary,
}

pub(crate) fn parse_sse_line(line: &str) -> Option<SseField<'_>> {
    if line.is_empty() {
        return Some(SseField::Boundary);
    }
    let (field, value) = line.split_once(':')?;
    let value = value.strip_prefix(' ').unwrap_or(value);
    match field {
        "event" => Some(SseField::Event(value)),
        "data" => Some(SseField::Data(value)),
        // Comments (": keep-alive") and id/retry fields are ignored.
        _ => None,
    }
}

/// Translates SSE fields of one provider dialect into [`RawEvent`]s.
pub(crate) trait SseHandler: Send + 'static {
    /// Handle one field. Returns true once the provider signalled the end
    /// of the message.
    fn on_field(&mut self, field: SseField<'_>, out: &mut VecDeque<RawEvent>) -> bool;

    /// Called when the byte stream ends without an explicit end marker.
    fn on_end(&mut self, _out: &mut VecDeque<RawEvent>) {}
}

struct SseState<H> {
    byte_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
    handler: H,
    pending: VecDeque<RawEvent>,
    finished: bool,
}

impl<H: SseHandler> SseState<H> {
    fn take_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.buffer.drain(..=end).collect();
        Some(decode_line(&raw[..end]))
    }

    fn handle_line(&mut self, line: &str) {
        if let Some(field) = parse_sse_line(line)
            && self.handler.on_field(field, &mut self.pending)
        {
            self.finished = true;
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Turn an HTTP byte stream into a stream of raw provider events.
pub(crate) fn sse_stream<S, H>(byte_stream: S, handler: H) -> RawEventStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    H: SseHandler,
{
    Box::pin(futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(byte_stream),
            buffer: Vec::new(),
            handler,
            pending: VecDeque::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.finished {
                    return None;
                }
                if let Some(line) = state.take_line() {
                    state.handle_line(&line);
                    continue;
                }

                match state.byte_stream.next().await {
                    Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(LlmError::Network(e.to_string())), state));
                    }
                    None => {
                        if !state.buffer.is_empty() {
                            let rest = std::mem::take(&mut state.buffer);
                            let line = decode_line(&rest);
                            state.handle_line(&line);
                        }
                        if !state.finished {
                            state.handler.on_end(&mut state.pending);
                            state.finished = true;
                        }
                    }
                }
            }
        },
    ))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(
            parse_sse_line("event: message_start"),
            Some(SseField::Event("message_start"))
        );
        assert_eq!(
            parse_sse_line("data: {\"foo\": 1}"),
            Some(SseField::Data("{\"foo\": 1}"))
        );
        assert_eq!(parse_sse_line("data:[DONE]"), Some(SseField::Data("[DONE]")));
        assert_eq!(parse_sse_line(""), Some(SseField::Boundary));
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line("invalid"), None);
    }

    /// Echoes every data line back as a text delta.
    struct Echo;

    impl SseHandler for Echo {
        fn on_field(&mut self, field: SseField<'_>, out: &mut VecDeque<RawEvent>) -> bool {
            if let SseField::Data(data) = field {
                if data == "[END]" {
                    return true;
                }
                out.push_back(RawEvent::text_delta(0, data));
            }
            false
        }

        fn on_end(&mut self, out: &mut VecDeque<RawEvent>) {
            out.push_back(RawEvent::MessageStop);
        }
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let events = test_support::collect(
            &[b"data: hel", b"lo\r\n\ndata: w", b"orld\n\n"],
            Echo,
        )
        .await;

        assert_eq!(
            events,
            vec![
                RawEvent::text_delta(0, "hello"),
                RawEvent::text_delta(0, "world"),
                RawEvent::MessageStop,
            ]
        );
    }

    #[tokio::test]
    async fn test_multibyte_char_split_across_chunks() {
        let text = "data: caf\u{e9}\n";
        let bytes = text.as_bytes();
        let split = bytes.len() - 2;
        let events = test_support::collect(&[&bytes[..split], &bytes[split..]], Echo).await;

        assert_eq!(events[0], RawEvent::text_delta(0, "caf\u{e9}"));
    }

    #[tokio::test]
    async fn test_end_marker_stops_without_on_end() {
        let events = test_support::collect(&[b"data: a\ndata: [END]\ndata: b\n"], Echo).await;
        assert_eq!(events, vec![RawEvent::text_delta(0, "a")]);
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline() {
        let events = test_support::collect(&[b"data: tail"], Echo).await;
        assert_eq!(
            events,
            vec![RawEvent::text_delta(0, "tail"), RawEvent::MessageStop]
        );
    }
}
