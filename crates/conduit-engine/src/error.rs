//! Error types for the engine crate.

use std::time::Duration;

use conduit_mcp::McpError;
use thiserror::Error;

/// Result type alias using the engine error type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error type for query orchestration.
///
/// Tool-level variants never end a query: the engine turns them into failed
/// tool results. The rest terminate the query stream with an error marker.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Upstream LLM failure (auth, rate limit, malformed request, stream error).
    #[error("provider error: {0}")]
    Provider(#[from] conduit_llm::LlmError),

    /// The provider call did not finish before its deadline.
    #[error("provider did not finish within {}s", .0.as_secs_f64())]
    ProviderTimeout(Duration),

    /// No tool with this name is registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The tool server behind a tool is unreachable.
    #[error("connection to tool server '{0}' lost")]
    ConnectionLost(String),

    /// The tool ran (or was attempted) and failed.
    #[error("tool '{tool}' failed: {message}")]
    ToolInvocation { tool: String, message: String },

    /// The tool-call round limit was exceeded.
    #[error("stopped after {max_rounds} tool rounds")]
    Truncated { max_rounds: u32 },

    /// The query was cancelled by its caller.
    #[error("query cancelled")]
    Cancelled,

    /// Engine misconfiguration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Stable machine-readable code, used for error markers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provider(_) => "provider_error",
            Self::ProviderTimeout(_) => "provider_timeout",
            Self::UnknownTool(_) => "unknown_tool",
            Self::ConnectionLost(_) => "connection_lost",
            Self::ToolInvocation { .. } => "tool_invocation",
            Self::Truncated { .. } => "truncated",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
        }
    }

    /// Whether this error is answered with a failed tool result instead of
    /// ending the query.
    pub fn is_tool_level(&self) -> bool {
        matches!(
            self,
            Self::UnknownTool(_) | Self::ConnectionLost(_) | Self::ToolInvocation { .. }
        )
    }

    pub fn tool_invocation(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolInvocation {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn tool_timeout(tool: impl Into<String>, after: Duration) -> Self {
        Self::tool_invocation(tool, format!("timed out after {}s", after.as_secs_f64()))
    }

    /// Classify a registry error for the tool `tool`.
    pub fn from_tool_error(tool: &str, err: McpError) -> Self {
        match err {
            McpError::UnknownTool(name) => Self::UnknownTool(name),
            McpError::ConnectionLost { server } => Self::ConnectionLost(server),
            McpError::ToolFailed { tool, message } => Self::ToolInvocation { tool, message },
            other if other.is_fatal_to_session() => Self::ConnectionLost(tool.to_string()),
            other => Self::tool_invocation(tool, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        let cases = [
            (
                EngineError::Provider(conduit_llm::LlmError::Auth("bad key".into())),
                "provider_error",
            ),
            (
                EngineError::ProviderTimeout(Duration::from_secs(2)),
                "provider_timeout",
            ),
            (EngineError::UnknownTool("x".into()), "unknown_tool"),
            (EngineError::ConnectionLost("db".into()), "connection_lost"),
            (EngineError::tool_invocation("db__q", "boom"), "tool_invocation"),
            (EngineError::Truncated { max_rounds: 10 }, "truncated"),
            (EngineError::Cancelled, "cancelled"),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn test_from_tool_error() {
        let err = EngineError::from_tool_error("db__q", McpError::connection_lost("db"));
        assert!(matches!(err, EngineError::ConnectionLost(ref s) if s == "db"));

        let err = EngineError::from_tool_error("db__q", McpError::ConnectionClosed);
        assert_eq!(err.kind(), "connection_lost");

        let err = EngineError::from_tool_error("db__q", McpError::tool_failed("db__q", "no table"));
        assert_eq!(err.to_string(), "tool 'db__q' failed: no table");

        let err = EngineError::from_tool_error("db__q", McpError::Timeout);
        assert_eq!(err.kind(), "tool_invocation");
        assert!(err.is_tool_level());
        assert!(!EngineError::Cancelled.is_tool_level());
    }

    #[test]
    fn test_timeout_messages() {
        let err = EngineError::ProviderTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "provider did not finish within 1.5s");

        let err = EngineError::tool_timeout("web__search", Duration::from_secs(30));
        assert_eq!(err.to_string(), "tool 'web__search' failed: timed out after 30s");
    }
}
