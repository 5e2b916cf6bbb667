//! API routes.

pub mod chat;
pub mod health;
pub mod tools;

pub use chat::{
    CONVERSATION_HEADER, ChatError, ChatRequest, ChatResponse, chat_handler, error_marker,
    strip_json_fence,
};
pub use health::{HealthResponse, WelcomeResponse, health_routes};
pub use tools::{ToolEntry, list_tools_handler};
