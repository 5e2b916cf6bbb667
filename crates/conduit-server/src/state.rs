//! Application state shared across handlers.

use std::sync::Arc;

use conduit_engine::{EngineBuilder, EngineConfig, OrchestrationEngine};
use conduit_llm::SharedAdapter;
use conduit_mcp::ToolRegistry;

use crate::config::ServerConfig;
use crate::conversations::ConversationStore;

/// Application state shared across all handlers.
///
/// Engines are single-use, so the state keeps what is needed to build one
/// per request rather than an engine itself.
#[derive(Clone)]
pub struct AppState {
    /// Provider adapter shared by every query.
    pub provider: SharedAdapter,

    /// Tool registry shared by every query.
    pub registry: Arc<ToolRegistry>,

    /// Settings applied to each engine.
    pub engine_config: Arc<EngineConfig>,

    /// Server configuration.
    pub config: Arc<ServerConfig>,

    /// Finished conversations.
    pub conversations: ConversationStore,
}

impl AppState {
    pub fn new(
        provider: SharedAdapter,
        registry: Arc<ToolRegistry>,
        engine_config: EngineConfig,
        config: ServerConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            engine_config: Arc::new(engine_config),
            config: Arc::new(config),
            conversations: ConversationStore::new(),
        }
    }

    /// A builder preloaded with the shared provider, registry and settings.
    pub fn engine_builder(&self) -> EngineBuilder {
        OrchestrationEngine::builder()
            .provider(self.provider.clone())
            .registry(self.registry.clone())
            .config(self.engine_config.as_ref().clone())
    }
}
