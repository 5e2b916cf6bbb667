//! Namespace-qualified tool catalog across all live connections.
//!
//! Readers take an `Arc<ToolSnapshot>` and keep using it for as long as they
//! like. Adding or removing a connection builds a fresh snapshot and swaps
//! the pointer, so a query that started against the old tool set never sees
//! a half-updated one.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit_mcp::{McpServerConfig, ToolRegistry};
//!
//! let registry = ToolRegistry::new();
//! registry
//!     .connect_all(vec![
//!         McpServerConfig::new("sqlite", "mcp-server-sqlite").with_arg("--db").with_arg("test.db"),
//!     ])
//!     .await;
//!
//! for tool in registry.snapshot().iter() {
//!     println!("{}", tool.qualified_name);
//! }
//!
//! let rows = registry.invoke("sqlite__read_query", Some(json!({"query": "SELECT 1"}))).await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::connection::{McpConnection, McpServerConfig, ToolConnection};
use crate::error::{McpError, Result};
use crate::protocol::{CallToolResult, ToolInfo};

/// Separator between server namespace and local tool name.
///
/// Provider function names are limited to `[A-Za-z0-9_-]`, which rules out
/// the more natural `:` or `/`.
pub const NAMESPACE_DELIMITER: &str = "__";

/// A tool as exposed to the model.
#[derive(Clone)]
pub struct Tool {
    /// `<server>__<tool>`, unique within a snapshot.
    pub qualified_name: String,
    pub server: String,
    /// Name the owning server knows the tool by.
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    connection: Weak<dyn ToolConnection>,
}

impl Tool {
    /// The owning connection, if the registry still holds it.
    pub fn connection(&self) -> Option<Arc<dyn ToolConnection>> {
        self.connection.upgrade()
    }

    /// True while the owning connection is registered and still up.
    pub fn is_available(&self) -> bool {
        self.connection().is_some_and(|c| c.is_connected())
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("qualified_name", &self.qualified_name)
            .field("server", &self.server)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Immutable view of every tool at one point in time.
#[derive(Debug, Default)]
pub struct ToolSnapshot {
    tools: Vec<Tool>,
    index: HashMap<String, usize>,
}

impl ToolSnapshot {
    pub fn get(&self, qualified_name: &str) -> Option<&Tool> {
        self.index.get(qualified_name).map(|&i| &self.tools[i])
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.index.contains_key(qualified_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tool> {
        self.tools.iter()
    }

    /// Tools whose connection is still up. This is what gets advertised to
    /// the model; a lost server's tools stay resolvable so late calls to
    /// them fail with `ConnectionLost` instead of `UnknownTool`.
    pub fn available(&self) -> impl Iterator<Item = &Tool> {
        self.tools.iter().filter(|tool| tool.is_available())
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.qualified_name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

struct RegisteredServer {
    connection: Arc<dyn ToolConnection>,
    tools: Vec<ToolInfo>,
}

/// Aggregates tools from all active connections under qualified names.
///
/// The registry owns the connections; snapshot entries only hold weak
/// references to them.
#[derive(Default)]
pub struct ToolRegistry {
    servers: Mutex<BTreeMap<String, RegisteredServer>>,
    snapshot: RwLock<Arc<ToolSnapshot>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current tool set. Cheap; clones an `Arc`.
    pub fn snapshot(&self) -> Arc<ToolSnapshot> {
        self.snapshot.read().clone()
    }

    /// Alias for [`snapshot`](Self::snapshot).
    pub fn list_tools(&self) -> Arc<ToolSnapshot> {
        self.snapshot()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.lock().keys().cloned().collect()
    }

    pub fn connection(&self, server: &str) -> Option<Arc<dyn ToolConnection>> {
        self.servers
            .lock()
            .get(server)
            .map(|s| Arc::clone(&s.connection))
    }

    /// Register a connection and publish a snapshot including its tools.
    ///
    /// A connection already registered under the same server name is
    /// replaced and closed.
    pub async fn add_connection(&self, connection: Arc<dyn ToolConnection>) -> Result<usize> {
        let tools = connection.list_tools().await?;
        let name = connection.server_name().to_string();
        let count = tools.len();

        let replaced = {
            let mut servers = self.servers.lock();
            let replaced = servers.insert(name.clone(), RegisteredServer { connection, tools });
            self.publish(&servers);
            replaced
        };

        if let Some(old) = replaced {
            tracing::info!(server = %name, "replacing existing MCP connection");
            if let Err(e) = old.connection.close().await {
                tracing::debug!(server = %name, error = %e, "error closing replaced connection");
            }
        }

        tracing::info!(server = %name, tool_count = count, "registered tool server");
        Ok(count)
    }

    /// Drop a connection and publish a snapshot without its tools.
    pub async fn remove_connection(&self, server: &str) -> bool {
        let removed = {
            let mut servers = self.servers.lock();
            let removed = servers.remove(server);
            if removed.is_some() {
                self.publish(&servers);
            }
            removed
        };

        match removed {
            Some(entry) => {
                if let Err(e) = entry.connection.close().await {
                    tracing::debug!(server = %server, error = %e, "error closing connection");
                }
                tracing::info!(server = %server, "removed tool server");
                true
            }
            None => false,
        }
    }

    /// Connect to every configured server concurrently.
    ///
    /// Servers that fail to start or handshake are logged and skipped.
    /// Returns the number that joined the registry.
    pub async fn connect_all(&self, configs: Vec<McpServerConfig>) -> usize {
        let total = configs.len();
        let attempts = configs.into_iter().map(|config| async move {
            let name = config.name.clone();
            (name, McpConnection::connect(config).await)
        });

        let mut connected = 0;
        for (name, result) in futures::future::join_all(attempts).await {
            let outcome = match result {
                Ok(connection) => self.add_connection(Arc::new(connection)).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(_) => connected += 1,
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "failed to connect to MCP server")
                }
            }
        }

        tracing::info!(connected, total, "MCP server connection complete");
        connected
    }

    /// Run a tool by qualified name.
    ///
    /// Tool-reported failures (`isError`) come back as
    /// [`McpError::ToolFailed`] so callers see one error path for every way
    /// a call can go wrong.
    pub async fn invoke(&self, qualified_name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        let snapshot = self.snapshot();
        let tool = snapshot
            .get(qualified_name)
            .ok_or_else(|| McpError::UnknownTool(qualified_name.to_string()))?;

        let connection = tool
            .connection()
            .filter(|c| c.is_connected())
            .ok_or_else(|| McpError::connection_lost(&tool.server))?;

        tracing::debug!(tool = %qualified_name, server = %tool.server, "invoking tool");

        let result = connection.call_tool(&tool.name, arguments).await?;
        if result.is_error() {
            return Err(McpError::tool_failed(qualified_name, result.render_text()));
        }
        Ok(result)
    }

    /// Close every connection and publish an empty snapshot.
    pub async fn shutdown_all(&self) {
        let servers = {
            let mut servers = self.servers.lock();
            let taken = std::mem::take(&mut *servers);
            self.publish(&servers);
            taken
        };

        for (name, entry) in servers {
            if let Err(e) = entry.connection.close().await {
                tracing::warn!(server = %name, error = %e, "error shutting down MCP server");
            }
        }
    }

    /// Rebuild the snapshot from the server table and swap it in.
    fn publish(&self, servers: &BTreeMap<String, RegisteredServer>) {
        let snapshot = Arc::new(build_snapshot(servers));
        tracing::debug!(tool_count = snapshot.len(), "published tool snapshot");
        *self.snapshot.write() = snapshot;
    }
}

fn build_snapshot(servers: &BTreeMap<String, RegisteredServer>) -> ToolSnapshot {
    let mut snapshot = ToolSnapshot::default();

    for (server, entry) in servers {
        for info in &entry.tools {
            let base = qualify(server, &info.name);
            let mut qualified = base.clone();
            let mut suffix = 2;
            while snapshot.index.contains_key(&qualified) {
                qualified = format!("{}_{}", base, suffix);
                suffix += 1;
            }
            if qualified != base {
                tracing::warn!(
                    server = %server,
                    tool = %info.name,
                    qualified = %qualified,
                    "qualified tool name collided; renamed"
                );
            }

            snapshot.index.insert(qualified.clone(), snapshot.tools.len());
            snapshot.tools.push(Tool {
                qualified_name: qualified,
                server: server.clone(),
                name: info.name.clone(),
                description: info.description.clone(),
                input_schema: info
                    .input_schema
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
                connection: Arc::downgrade(&entry.connection),
            });
        }
    }

    snapshot
}

/// Build `<server>__<tool>` using only characters every provider accepts.
pub fn qualify(server: &str, tool: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect()
    };
    format!("{}{}{}", clean(server), NAMESPACE_DELIMITER, clean(tool))
}
