//! Transport layer for MCP communication.
//!
//! Local servers are spawned as child processes and spoken to with
//! newline-delimited JSON-RPC over stdin/stdout. Remote servers take one
//! JSON-RPC message per HTTP POST.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{McpError, Result};
use crate::protocol::{
    IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};

/// Configuration for HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub url: String,
    pub timeout: Duration,
    /// Retries for requests that failed before reaching the server.
    pub retries: u32,
    pub headers: Vec<(String, String)>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(30),
            retries: 3,
            headers: Vec::new(),
        }
    }
}

impl HttpTransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Transport for communicating with an MCP server.
pub enum McpTransport {
    Stdio {
        child: Child,
        stdin: BufWriter<ChildStdin>,
        stdout: BufReader<ChildStdout>,
    },
    Http {
        client: reqwest::Client,
        config: HttpTransportConfig,
    },
}

impl McpTransport {
    /// Spawn a server process and wire up its stdio.
    ///
    /// An env entry with an empty value is filled from this process's
    /// environment, so a config can name a secret without containing it.
    /// The child's stderr is forwarded to `tracing` at debug level.
    pub fn spawn_stdio(
        server: &str,
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in env {
            if value.is_empty() {
                if let Ok(inherited) = std::env::var(key) {
                    cmd.env(key, inherited);
                }
            } else {
                cmd.env(key, value);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::spawn_failed(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::spawn_failed("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::spawn_failed("failed to capture stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "{}", line);
                }
            });
        }

        Ok(Self::Stdio {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
        })
    }

    /// Create an HTTP transport. No request is made until the handshake.
    pub fn connect_http(config: HttpTransportConfig) -> Result<Self> {
        url::Url::parse(&config.url)
            .map_err(|e| McpError::transport(format!("invalid URL: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(5)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| McpError::transport(format!("failed to build HTTP client: {}", e)))?;

        tracing::info!(
            url = %config.url,
            timeout_secs = config.timeout.as_secs(),
            "created HTTP transport"
        );

        Ok(Self::Http { client, config })
    }

    /// Send a request and wait for the response carrying the same id.
    pub async fn send_request(&mut self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        match self {
            Self::Stdio { stdin, stdout, .. } => {
                write_line(stdin, &serde_json::to_string(request)?).await?;
                read_response(stdin, stdout, request.id).await
            }
            Self::Http { client, config } => send_request_http(client, config, request).await,
        }
    }

    /// Send a notification (no response expected).
    pub async fn send_notification(&mut self, notification: &JsonRpcNotification) -> Result<()> {
        match self {
            Self::Stdio { stdin, .. } => {
                write_line(stdin, &serde_json::to_string(notification)?).await
            }
            Self::Http { client, config } => {
                let mut req = client.post(&config.url).json(notification);
                for (key, value) in &config.headers {
                    req = req.header(key, value);
                }
                if let Err(e) = req.send().await {
                    tracing::debug!(error = %e, "MCP HTTP notification failed");
                }
                Ok(())
            }
        }
    }

    /// Terminate the server process. HTTP has nothing to tear down.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Self::Stdio { child, .. } = self {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "MCP server already exited");
            }
        }
        Ok(())
    }

    /// Whether the server process is still running.
    pub fn is_connected(&mut self) -> bool {
        match self {
            Self::Stdio { child, .. } => matches!(child.try_wait(), Ok(None)),
            Self::Http { .. } => true,
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http { .. })
    }

    pub fn is_stdio(&self) -> bool {
        matches!(self, Self::Stdio { .. })
    }
}

async fn write_line(stdin: &mut BufWriter<ChildStdin>, json: &str) -> Result<()> {
    stdin.write_all(json.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    tracing::trace!(json = %json, "sent MCP message");
    Ok(())
}

/// Read lines until the response for `id` arrives.
///
/// A call abandoned mid-flight leaves its response in the pipe; the next
/// caller reads past it here instead of mistaking it for its own.
async fn read_response(
    stdin: &mut BufWriter<ChildStdin>,
    stdout: &mut BufReader<ChildStdout>,
    id: u64,
) -> Result<JsonRpcResponse> {
    let mut line = String::new();
    loop {
        line.clear();
        if stdout.read_line(&mut line).await? == 0 {
            return Err(McpError::ConnectionClosed);
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        tracing::trace!(json = %trimmed, "received MCP message");

        match IncomingMessage::parse(trimmed) {
            Ok(IncomingMessage::Response(response)) if response.id == id => return Ok(response),
            Ok(IncomingMessage::Response(response)) => {
                tracing::debug!(expected = id, got = response.id, "discarding stale MCP response");
            }
            Ok(IncomingMessage::Request(request)) => {
                let reply = if request.method == "ping" {
                    JsonRpcResponse::success(request.id, serde_json::json!({}))
                } else {
                    JsonRpcResponse::failure(
                        request.id,
                        JsonRpcError::METHOD_NOT_FOUND,
                        format!("client does not handle '{}'", request.method),
                    )
                };
                write_line(stdin, &serde_json::to_string(&reply)?).await?;
            }
            Ok(IncomingMessage::Notification(note)) => {
                tracing::trace!(method = %note.method, "ignoring MCP notification");
            }
            Err(e) => {
                tracing::warn!(error = %e, line = %trimmed, "unparseable line from MCP server");
            }
        }
    }
}

async fn send_request_http(
    client: &reqwest::Client,
    config: &HttpTransportConfig,
    request: &JsonRpcRequest,
) -> Result<JsonRpcResponse> {
    let mut retries = config.retries;
    // HTTP is stateless: an unreachable endpoint fails this request only,
    // it never ends the session.
    loop {
        let mut req = client.post(&config.url).json(request);
        for (key, value) in &config.headers {
            req = req.header(key, value);
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                let body = resp
                    .text()
                    .await
                    .map_err(|e| McpError::transport(format!("failed to read response body: {}", e)))?;
                if !status.is_success() {
                    return Err(McpError::transport(format!("HTTP error {}: {}", status, body)));
                }
                tracing::trace!(json = %body, "received MCP HTTP response");
                return Ok(serde_json::from_str(&body)?);
            }
            Err(e) if retries > 0 && (e.is_connect() || e.is_timeout()) => {
                retries -= 1;
                tracing::warn!(error = %e, retries_remaining = retries, "HTTP request failed, retrying");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) if e.is_connect() || e.is_timeout() => {
                return Err(McpError::transport(format!(
                    "MCP server unreachable after {} retries: {}",
                    config.retries, e
                )));
            }
            Err(e) => return Err(McpError::transport(format!("HTTP request failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_nonexistent_command() {
        let result = McpTransport::spawn_stdio("test", "nonexistent-mcp-server-12345", &[], &[]);
        assert!(matches!(result, Err(McpError::SpawnFailed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_closed_stdout_is_connection_closed() {
        // `true` exits immediately, so the read side hits EOF.
        let mut transport = McpTransport::spawn_stdio("test", "true", &[], &[]).unwrap();
        let request = JsonRpcRequest::new(1, "tools/list", None);
        let err = transport.send_request(&request).await.unwrap_err();
        assert!(err.is_fatal_to_session(), "unexpected error: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_skips_foreign_lines() {
        // The fake server prints a notification and a stale response before
        // the real one; only id 2 must be returned.
        let script = r#"read line; printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/message"}' '{"jsonrpc":"2.0","id":1,"result":{"stale":true}}' '{"jsonrpc":"2.0","id":2,"result":{"ok":true}}'"#;
        let mut transport = McpTransport::spawn_stdio(
            "test",
            "sh",
            &["-c".to_string(), script.to_string()],
            &[],
        )
        .unwrap();

        let response = transport
            .send_request(&JsonRpcRequest::new(2, "tools/list", None))
            .await
            .unwrap();
        assert_eq!(response.id, 2);
        assert_eq!(response.result.unwrap()["ok"], true);
    }

    #[test]
    fn test_http_transport_config() {
        let config = HttpTransportConfig::new("http://localhost:8080/mcp")
            .with_timeout(Duration::from_secs(60))
            .with_retries(5)
            .with_header("Authorization", "Bearer token123");

        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.retries, 5);
        assert_eq!(config.headers.len(), 1);
    }

    #[test]
    fn test_http_transport_config_default() {
        let config = HttpTransportConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.retries, 3);
    }

    #[test]
    fn test_http_transport_invalid_url() {
        let result = McpTransport::connect_http(HttpTransportConfig::new("not a valid url"));
        match result {
            Err(McpError::Transport(msg)) => assert!(msg.contains("invalid URL")),
            _ => panic!("expected Transport error"),
        }
    }

    #[tokio::test]
    async fn test_http_transport_is_stateless() {
        let mut transport =
            McpTransport::connect_http(HttpTransportConfig::new("http://localhost:8080/mcp"))
                .unwrap();
        assert!(transport.is_http());
        assert!(transport.is_connected());
        transport.shutdown().await.unwrap();
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_http_unreachable_is_not_fatal_to_session() {
        // Grab a free port and release it so nothing is listening there.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = HttpTransportConfig::new(format!("http://127.0.0.1:{port}/mcp"))
            .with_timeout(Duration::from_secs(2))
            .with_retries(1);
        let mut transport = McpTransport::connect_http(config).unwrap();

        let request = JsonRpcRequest::new(1, "tools/list", None);
        let err = transport.send_request(&request).await.unwrap_err();

        assert!(matches!(&err, McpError::Transport(msg) if msg.contains("unreachable")));
        assert!(!err.is_fatal_to_session());
        assert!(transport.is_connected());
    }
}
