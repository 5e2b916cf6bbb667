//! A live session with one MCP server.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{McpError, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, ListToolsResult, ServerInfo, ToolInfo,
};
use crate::transport::{HttpTransportConfig, McpTransport};

/// Default time allowed for the initialize handshake.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// What the orchestration layer needs from a tool server.
///
/// [`McpConnection`] is the production implementation; tests and embedders
/// can register anything else that can list and run tools.
#[async_trait]
pub trait ToolConnection: Send + Sync {
    /// Name the server was registered under.
    fn server_name(&self) -> &str;

    /// Tools the server currently offers, under their local names.
    async fn list_tools(&self) -> Result<Vec<ToolInfo>>;

    /// Run a tool by its local name.
    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult>;

    /// End the session. Further calls fail with `ConnectionLost`.
    async fn close(&self) -> Result<()>;

    /// Whether the session is still usable.
    fn is_connected(&self) -> bool;
}

/// Transport type for MCP server connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TransportType {
    #[default]
    Stdio,
    Http,
}

/// Configuration for an MCP server connection.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Unique name; becomes the namespace of the server's tools.
    pub name: String,
    pub transport: TransportType,
    /// Command to spawn (stdio).
    pub command: String,
    /// Server URL (HTTP).
    pub url: Option<String>,
    pub args: Vec<String>,
    /// Environment for the child. Empty values inherit from this process.
    pub env: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// Request timeout (HTTP) and handshake timeout (both).
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl McpServerConfig {
    /// Create a config for a server spawned over stdio.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportType::Stdio,
            command: command.into(),
            url: None,
            args: Vec::new(),
            env: Vec::new(),
            headers: Vec::new(),
            timeout: None,
            retries: None,
        }
    }

    /// Create a config for a remote server reached over HTTP.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: TransportType::Http,
            url: Some(url.into()),
            ..Self::new(name, String::new())
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn is_http(&self) -> bool {
        self.transport == TransportType::Http
    }

    pub fn is_stdio(&self) -> bool {
        self.transport == TransportType::Stdio
    }
}

/// An initialized session with a single MCP server.
///
/// The transport sits behind an async mutex, which doubles as the
/// connection's invocation queue: concurrent callers take turns, and each
/// request/response pair runs to completion before the next begins.
pub struct McpConnection {
    config: McpServerConfig,
    transport: Mutex<McpTransport>,
    server_info: ServerInfo,
    request_id: AtomicU64,
    lost: AtomicBool,
}

impl McpConnection {
    /// Open the transport and perform the initialize handshake.
    pub async fn connect(config: McpServerConfig) -> Result<Self> {
        let transport = match config.transport {
            TransportType::Stdio => {
                let transport = McpTransport::spawn_stdio(
                    &config.name,
                    &config.command,
                    &config.args,
                    &config.env,
                )?;
                tracing::info!(
                    server = %config.name,
                    command = %config.command,
                    "spawned MCP server"
                );
                transport
            }
            TransportType::Http => {
                let url = config
                    .url
                    .as_ref()
                    .ok_or_else(|| McpError::transport("HTTP transport requires a URL"))?;
                let mut http = HttpTransportConfig::new(url);
                if let Some(timeout) = config.timeout {
                    http = http.with_timeout(timeout);
                }
                if let Some(retries) = config.retries {
                    http = http.with_retries(retries);
                }
                for (key, value) in &config.headers {
                    http = http.with_header(key, value);
                }
                McpTransport::connect_http(http)?
            }
        };

        let handshake_timeout = config.timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);
        let mut transport = transport;
        let server_info = tokio::time::timeout(handshake_timeout, handshake(&mut transport))
            .await
            .map_err(|_| McpError::Timeout)??;

        tracing::info!(
            server = %config.name,
            remote = %server_info.name,
            version = %server_info.version,
            "MCP server initialized"
        );

        Ok(Self {
            config,
            transport: Mutex::new(transport),
            server_info,
            // Ids 1 and 2 were spent on the handshake.
            request_id: AtomicU64::new(3),
            lost: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    /// Identity the server reported during the handshake.
    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::SeqCst) {
            tracing::warn!(server = %self.config.name, "MCP server connection lost");
        }
    }

    /// Send a request through the queue and unwrap the JSON-RPC result.
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(McpError::connection_lost(&self.config.name));
        }

        let mut transport = self.transport.lock().await;
        let request = JsonRpcRequest::new(
            self.request_id.fetch_add(1, Ordering::SeqCst),
            method,
            params,
        );

        match transport.send_request(&request).await {
            Ok(response) => response
                .into_result()
                .map_err(|e| McpError::server_error(e.code, e.message, e.data)),
            Err(e) if e.is_fatal_to_session() => {
                self.mark_lost();
                Err(McpError::connection_lost(&self.config.name))
            }
            Err(e) => Err(e),
        }
    }
}

async fn handshake(transport: &mut McpTransport) -> Result<ServerInfo> {
    let params = serde_json::to_value(InitializeParams::default())?;
    let response = transport
        .send_request(&JsonRpcRequest::new(1, "initialize", Some(params)))
        .await?
        .into_result()
        .map_err(|e| McpError::server_error(e.code, e.message, e.data))?;
    let init: InitializeResult = serde_json::from_value(response)?;

    tracing::debug!(protocol = %init.protocol_version, "MCP handshake accepted");

    transport
        .send_notification(&JsonRpcNotification::new("notifications/initialized", None))
        .await?;

    Ok(init.server_info)
}

#[async_trait]
impl ToolConnection for McpConnection {
    fn server_name(&self) -> &str {
        &self.config.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let result = self.send_request("tools/list", None).await?;
        let list: ListToolsResult = serde_json::from_value(result)?;

        tracing::debug!(
            server = %self.config.name,
            tool_count = list.tools.len(),
            "listed MCP tools"
        );

        Ok(list.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let result = self
            .send_request("tools/call", Some(serde_json::to_value(&params)?))
            .await?;
        let call: CallToolResult = serde_json::from_value(result)?;

        if call.is_error() {
            tracing::warn!(server = %self.config.name, tool = %name, "tool call returned error");
        } else {
            tracing::debug!(server = %self.config.name, tool = %name, "tool call succeeded");
        }

        Ok(call)
    }

    async fn close(&self) -> Result<()> {
        tracing::info!(server = %self.config.name, "closing MCP connection");
        self.lost.store(true, Ordering::SeqCst);
        self.transport.lock().await.shutdown().await
    }

    fn is_connected(&self) -> bool {
        if self.lost.load(Ordering::SeqCst) {
            return false;
        }
        // A busy transport is mid-request, which means it was alive a moment ago.
        match self.transport.try_lock() {
            Ok(mut transport) => {
                let alive = transport.is_connected();
                if !alive {
                    self.mark_lost();
                }
                alive
            }
            Err(_) => true,
        }
    }
}
