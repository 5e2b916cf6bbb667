//! Error types for MCP connections and the tool registry.

use thiserror::Error;

/// Result type for MCP operations.
pub type Result<T> = std::result::Result<T, McpError>;

/// Error type for MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Failed to spawn the MCP server process.
    #[error("failed to spawn MCP server: {0}")]
    SpawnFailed(String),

    /// Failed to communicate with the MCP server.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON-RPC protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Server returned a JSON-RPC error response.
    #[error("server error {code}: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No tool with this qualified name is registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The server session behind a tool is gone.
    #[error("connection to MCP server '{server}' lost")]
    ConnectionLost { server: String },

    /// The tool ran but reported failure.
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// The server closed its end of the transport.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout waiting for response")]
    Timeout,
}

impl McpError {
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn server_error(
        code: i64,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn connection_lost(server: impl Into<String>) -> Self {
        Self::ConnectionLost {
            server: server.into(),
        }
    }

    pub fn tool_failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the underlying session can no longer be used.
    ///
    /// A dead child process surfaces as EOF, a broken pipe, or a closed
    /// stream depending on which side noticed first.
    pub fn is_fatal_to_session(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::ConnectionLost { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = McpError::spawn_failed("command not found");
        assert!(err.to_string().contains("spawn"));
        assert!(err.to_string().contains("command not found"));

        let err = McpError::server_error(-32601, "Method not found", None);
        assert!(err.to_string().contains("-32601"));

        let err = McpError::connection_lost("sqlite");
        assert_eq!(err.to_string(), "connection to MCP server 'sqlite' lost");
    }

    #[test]
    fn test_fatal_to_session() {
        assert!(McpError::ConnectionClosed.is_fatal_to_session());
        assert!(
            McpError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
                .is_fatal_to_session()
        );
        assert!(!McpError::Timeout.is_fatal_to_session());
        assert!(!McpError::tool_failed("echo", "bad input").is_fatal_to_session());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: McpError = json_err.into();
        assert!(matches!(err, McpError::Json(_)));
    }
}
