//! Streaming LLM provider adapters for Conduit.
//!
//! Each adapter opens one streaming completion and yields [`RawEvent`]s in
//! a provider-neutral shape. Interpretation of the streamed text happens
//! downstream, in the engine's decoder.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  ProviderAdapter trait                  │
//! │  - stream() -> Stream<RawEvent>         │
//! └─────────────────────────────────────────┘
//!                    │
//!     ┌──────────────┼──────────────┐
//!     ▼              ▼              ▼
//! ┌─────────┐   ┌──────────┐   ┌─────────┐
//! │Anthropic│   │  OpenAI  │   │  Local  │
//! └─────────┘   └──────────┘   └─────────┘
//! ```

pub mod adapter;
pub mod error;
pub mod provider;
pub mod types;

// Provider implementations
pub mod anthropic;
pub mod openai;

mod sse;

pub use adapter::{
    BlockStart, ContentDelta, ProviderAdapter, RawEvent, RawEventStream, SharedAdapter, with_retry,
};
pub use error::{LlmError, RateLimitInfo, Result};
pub use provider::{Provider, ProviderSettings, create_adapter};
pub use types::{
    CompletionRequest, Content, ContentBlock, Message, Role, StopReason, ToolDefinition, Usage,
};

pub use anthropic::{AnthropicAdapter, AnthropicConfig};
pub use openai::{OpenAiAdapter, OpenAiConfig};

#[cfg(any(test, feature = "testing"))]
pub use adapter::{MockAdapter, MockTurn};
