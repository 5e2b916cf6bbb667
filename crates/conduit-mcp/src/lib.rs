//! MCP (Model Context Protocol) connections and tool registry for Conduit.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ToolRegistry                                               │
//! │  - Owns connections, publishes Arc<ToolSnapshot>            │
//! │  - Qualified names: <server>__<tool>                        │
//! └─────────────────────────────────────────────────────────────┘
//!                           │ Arc<dyn ToolConnection>
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  McpConnection                                              │
//! │  - initialize handshake, tools/list, tools/call             │
//! │  - Async mutex = per-connection invocation queue            │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  McpTransport                                               │
//! │  - Stdio: newline-delimited JSON-RPC 2.0 to a child process │
//! │  - Http: one JSON-RPC message per POST                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The protocol flow is:
//! 1. Client sends `initialize` with its capabilities
//! 2. Server responds with its capabilities and identity
//! 3. Client sends `notifications/initialized`
//! 4. Client can now call `tools/list` and `tools/call`

pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use connection::{McpConnection, McpServerConfig, ToolConnection, TransportType};
pub use error::{McpError, Result};
pub use protocol::{CallToolResult, ServerInfo, ToolContent, ToolInfo};
pub use registry::{NAMESPACE_DELIMITER, Tool, ToolRegistry, ToolSnapshot, qualify};
pub use transport::{HttpTransportConfig, McpTransport};
