//! Streaming query orchestration for Conduit.
//!
//! ```text
//! query ─▶ OrchestrationEngine ──▶ ProviderAdapter::stream
//!               ▲      │                    │ RawEvent
//!               │      │                    ▼
//!     tool result      │              ChunkDecoder ──▶ Text ──▶ caller
//!               │      │                    │
//!               │      └──── ToolCallRequest┘
//!               │                 │
//!               └─── ToolRegistry::invoke
//! ```
//!
//! The engine is single-use: build one per query, call
//! [`OrchestrationEngine::submit`], and consume the returned stream.

pub mod conversation;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod unwrap;

pub use conversation::Conversation;
pub use decoder::{ChunkDecoder, DecodedEvent, JsonScanner, ToolCallRequest};
pub use engine::{
    EngineBuilder, EngineConfig, EngineState, OrchestrationEngine, QueryEvent, QueryStream,
};
pub use error::{EngineError, Result};
pub use unwrap::UnwrapRules;
