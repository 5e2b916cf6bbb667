//! Chat endpoint.
//!
//! `POST /chat` runs one query. With `streaming: true` the answer comes back
//! as chunked `text/plain`, one fragment per chunk; otherwise the fragments
//! are gathered into a JSON body.
//!
//! # Streamed error contract
//!
//! A streamed body that ends normally carries model text only. A query that
//! fails ends the body with one extra chunk, the marker line
//! `\n[[error:<kind>]] <message>\n`, and nothing is sent after it. The
//! marker is in-band, so model text can contain the same characters;
//! clients must only treat it as an error when it is the final line of the
//! body. The marker line never contains an inner newline. Clients that need
//! an unambiguous status should use the JSON mode, where `error` is a
//! separate field.

use std::convert::Infallible;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use conduit_engine::{QueryEvent, QueryStream};
use conduit_llm::Message;

use crate::conversations::ConversationStore;
use crate::error::ServerError;
use crate::state::AppState;

/// Response header carrying the conversation id.
pub const CONVERSATION_HEADER: &str = "x-conversation-id";

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for `POST /chat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// The user's message.
    pub message: String,

    /// Stream fragments as plain text instead of returning JSON.
    #[serde(default)]
    pub streaming: bool,

    /// Continue an earlier conversation. A new one is started when absent.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Response from the non-streaming chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub conversation_id: String,
    /// Tool rounds used; 0 when the query ended with an error.
    pub rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChatError>,
}

/// How a query ended early.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatError {
    pub kind: String,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler
// ─────────────────────────────────────────────────────────────────────────────

/// POST /chat
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ServerError> {
    if request.message.trim().is_empty() {
        return Err(ServerError::BadRequest(
            "Message content is required".to_string(),
        ));
    }

    let conversation_id = request
        .conversation_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let id_header = HeaderValue::from_str(&conversation_id)
        .map_err(|_| ServerError::BadRequest("conversation_id is not a valid header value".into()))?;

    let history = state
        .conversations
        .history(&conversation_id)
        .await
        .unwrap_or_default();
    tracing::info!(
        conversation_id = %conversation_id,
        history = history.len(),
        streaming = request.streaming,
        "Chat request"
    );

    let (archive_tx, archive_rx) = oneshot::channel();
    let engine = state
        .engine_builder()
        .history(history)
        .archive(archive_tx)
        .build()?;
    let events = engine.submit(request.message);

    let archive = Archive {
        receiver: archive_rx,
        store: state.conversations.clone(),
        conversation_id: conversation_id.clone(),
    };

    let mut response = if request.streaming {
        stream_text(events, archive)
    } else {
        Json(collect(events, archive).await).into_response()
    };
    response
        .headers_mut()
        .insert(HeaderName::from_static(CONVERSATION_HEADER), id_header);
    Ok(response)
}

/// Moves the engine's final conversation into the store.
struct Archive {
    receiver: oneshot::Receiver<Vec<Message>>,
    store: ConversationStore,
    conversation_id: String,
}

impl Archive {
    /// The engine sends before its terminal event, so this does not wait
    /// once the event stream is exhausted.
    async fn save(self) {
        match self.receiver.await {
            Ok(messages) => self.store.store(self.conversation_id, messages).await,
            Err(_) => tracing::debug!(
                conversation_id = %self.conversation_id,
                "Query ended without archiving"
            ),
        }
    }
}

fn stream_text(mut events: QueryStream, archive: Archive) -> Response {
    let body = async_stream::stream! {
        while let Some(event) = events.next().await {
            match event {
                QueryEvent::Text { content } => yield Ok::<_, Infallible>(content),
                QueryEvent::Error { kind, message } => yield Ok(error_marker(&kind, &message)),
                QueryEvent::ToolStart { name, .. } => {
                    tracing::debug!(tool = %name, "Tool started");
                }
                QueryEvent::ToolEnd { name, success, .. } => {
                    tracing::debug!(tool = %name, success, "Tool finished");
                }
                QueryEvent::Done { .. } => {}
            }
        }
        archive.save().await;
    };

    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )],
        Body::from_stream(body),
    )
        .into_response()
}

async fn collect(mut events: QueryStream, archive: Archive) -> ChatResponse {
    let mut text = String::new();
    let mut rounds = 0;
    let mut error = None;

    while let Some(event) = events.next().await {
        match event {
            QueryEvent::Text { content } => text.push_str(&content),
            QueryEvent::Done { rounds: used } => rounds = used,
            QueryEvent::Error { kind, message } => error = Some(ChatError { kind, message }),
            QueryEvent::ToolStart { .. } | QueryEvent::ToolEnd { .. } => {}
        }
    }

    let conversation_id = archive.conversation_id.clone();
    archive.save().await;

    ChatResponse {
        response: strip_json_fence(&text).to_string(),
        conversation_id,
        rounds,
        error,
    }
}

/// Trailing line that ends a streamed body on failure.
///
/// Newlines in `message` are flattened so the marker is always exactly the
/// last line of the body.
pub fn error_marker(kind: &str, message: &str) -> String {
    let message = message.replace(['\r', '\n'], " ");
    format!("\n[[error:{}]] {}\n", kind, message.trim())
}

/// Remove a surrounding ```` ```json ```` fence, if the whole text is one.
pub fn strip_json_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    else {
        return text;
    };
    match inner.strip_suffix("```") {
        Some(body) => body.trim(),
        None => text,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
