//! Shared fixtures for route tests.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_engine::EngineConfig;
use conduit_llm::{MockAdapter, MockTurn};
use conduit_mcp::{CallToolResult, McpError, ToolConnection, ToolInfo, ToolRegistry};
use serde_json::{Value, json};

use crate::config::ServerConfig;
use crate::state::AppState;

/// A `sqlite` server with `list_tables` and `query`.
pub struct SqliteStub;

#[async_trait]
impl ToolConnection for SqliteStub {
    fn server_name(&self) -> &str {
        "sqlite"
    }

    async fn list_tools(&self) -> conduit_mcp::Result<Vec<ToolInfo>> {
        Ok(vec![
            ToolInfo {
                name: "list_tables".into(),
                description: None,
                input_schema: None,
            },
            ToolInfo {
                name: "query".into(),
                description: Some("Run a read-only SQL query".into()),
                input_schema: Some(json!({
                    "type": "object",
                    "properties": {"sql": {"type": "string"}}
                })),
            },
        ])
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> conduit_mcp::Result<CallToolResult> {
        match name {
            "list_tables" => Ok(CallToolResult::text("customers, orders")),
            "query" => {
                let sql = arguments
                    .as_ref()
                    .and_then(|a| a.get("sql"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(CallToolResult::text(
                    json!({"rows": [{"sql": sql, "count": 42}]}).to_string(),
                ))
            }
            other => Err(McpError::UnknownTool(other.to_string())),
        }
    }

    async fn close(&self) -> conduit_mcp::Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

pub fn text_turns(answers: &[&str]) -> Vec<MockTurn> {
    answers.iter().map(|a| MockTurn::text(&[*a])).collect()
}

pub fn state_with(turns: Vec<MockTurn>, registry: Arc<ToolRegistry>) -> AppState {
    AppState::new(
        Arc::new(MockAdapter::new(turns)),
        registry,
        EngineConfig::default(),
        ServerConfig::default(),
    )
}

pub async fn state_with_tools(turns: Vec<MockTurn>) -> AppState {
    let registry = Arc::new(ToolRegistry::new());
    registry
        .add_connection(Arc::new(SqliteStub))
        .await
        .unwrap();
    state_with(turns, registry)
}
