//! Tool listing endpoint.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// One entry of `GET /tools`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEntry {
    /// Qualified name the model calls the tool by.
    pub name: String,
    pub server: String,
    /// Name on the owning server.
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// GET /tools - the current registry snapshot.
pub async fn list_tools_handler(State(state): State<AppState>) -> Json<Vec<ToolEntry>> {
    let snapshot = state.registry.snapshot();
    let tools = snapshot
        .iter()
        .map(|tool| ToolEntry {
            name: tool.qualified_name.clone(),
            server: tool.server.clone(),
            tool: tool.name.clone(),
            description: tool.description.clone(),
        })
        .collect();
    Json(tools)
}
