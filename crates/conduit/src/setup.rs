//! Turns loaded configuration into live components.
//!
//! Everything here is explicit: the resolved config goes in, adapters,
//! registries and engine settings come out. Nothing reads process globals
//! except credential lookup in `conduit_config::resolve_provider`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conduit_config::{
    ConduitConfig, McpServerEntry, McpTransportType, ProviderKind, ResolvedProvider,
    UnwrapSettings, resolve_provider,
};
use conduit_engine::{EngineConfig, OrchestrationEngine, UnwrapRules};
use conduit_llm::{Message, Provider, ProviderSettings, SharedAdapter, create_adapter};
use conduit_mcp::{McpServerConfig, ToolRegistry};

/// A provider, a tool registry and the engine settings to combine them with.
pub struct Runtime {
    pub provider: SharedAdapter,
    pub registry: Arc<ToolRegistry>,
    pub engine_config: EngineConfig,
}

impl Runtime {
    /// Resolve the provider and connect every enabled tool server.
    pub async fn start(config: &ConduitConfig, provider: Option<&str>) -> Result<Self> {
        let resolved = resolve_provider(config, provider)?;
        info!(
            provider = %resolved.name,
            kind = %resolved.kind,
            model = resolved.model.as_deref().unwrap_or("(default)"),
            "Using provider"
        );
        if let Some(source) = &resolved.api_key_source {
            debug!(provider = %resolved.name, source = %source, "API key resolved");
        }

        let engine_config = engine_config(config, &resolved);
        let adapter = create_adapter(provider_settings(&resolved))
            .with_context(|| format!("failed to create provider '{}'", resolved.name))?;
        let registry = connect_tools(config).await;

        Ok(Self {
            provider: adapter,
            registry,
            engine_config,
        })
    }

    /// A single-use engine continuing from `history`.
    pub fn engine(
        &self,
        history: Vec<Message>,
        archive: Option<oneshot::Sender<Vec<Message>>>,
        cancel: Option<CancellationToken>,
    ) -> Result<OrchestrationEngine> {
        let mut builder = OrchestrationEngine::builder()
            .provider(self.provider.clone())
            .registry(self.registry.clone())
            .config(self.engine_config.clone())
            .history(history);
        if let Some(sender) = archive {
            builder = builder.archive(sender);
        }
        if let Some(token) = cancel {
            builder = builder.cancellation(token);
        }
        Ok(builder.build()?)
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}

/// Connect the enabled `[[mcp.servers]]`. Bad entries and failed servers are skipped.
pub async fn connect_tools(config: &ConduitConfig) -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::new());
    let configs: Vec<McpServerConfig> = config
        .mcp_servers()
        .into_iter()
        .filter_map(|entry| match server_config(entry) {
            Ok(server) => Some(server),
            Err(e) => {
                warn!(server = %entry.name, error = %e, "Skipping MCP server");
                None
            }
        })
        .collect();

    if !configs.is_empty() {
        registry.connect_all(configs).await;
    }
    registry
}

pub fn server_config(entry: &McpServerEntry) -> Result<McpServerConfig> {
    let mut server = match entry.transport {
        McpTransportType::Stdio => {
            if entry.command.trim().is_empty() {
                return Err(anyhow!("stdio server '{}' has no command", entry.name));
            }
            McpServerConfig::new(&entry.name, &entry.command).with_args(entry.args.clone())
        }
        McpTransportType::Http => {
            let url = entry
                .url
                .as_deref()
                .ok_or_else(|| anyhow!("http server '{}' has no url", entry.name))?;
            McpServerConfig::http(&entry.name, url)
        }
    };

    server = server.with_env(
        entry
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    for (key, value) in &entry.headers {
        server = server.with_header(key, value);
    }
    if let Some(secs) = entry.timeout_secs {
        server = server.with_timeout(Duration::from_secs(secs));
    }
    if let Some(retries) = entry.retries {
        server = server.with_retries(retries);
    }
    Ok(server)
}

pub fn provider_settings(resolved: &ResolvedProvider) -> ProviderSettings {
    let provider = match resolved.kind {
        ProviderKind::Anthropic => Provider::Anthropic,
        ProviderKind::Openai => Provider::OpenAi,
        ProviderKind::Groq => Provider::Groq,
        ProviderKind::Local => Provider::Local,
    };

    let mut settings = ProviderSettings::new(provider);
    if let Some(model) = &resolved.model {
        settings = settings.with_model(model);
    }
    if let Some(key) = &resolved.api_key {
        settings = settings.with_api_key(key);
    }
    if let Some(url) = &resolved.base_url {
        settings = settings.with_base_url(url);
    }
    if let Some(secs) = resolved.timeout_secs {
        settings = settings.with_timeout(Duration::from_secs(secs));
    }
    settings.max_retries = resolved.max_retries;
    settings
}

pub fn engine_config(config: &ConduitConfig, resolved: &ResolvedProvider) -> EngineConfig {
    let settings = config.engine_settings();
    let mut engine = EngineConfig::new().with_unwrap_rules(unwrap_rules(settings.unwrap.as_ref()));

    if let Some(rounds) = settings.max_rounds {
        engine = engine.with_max_rounds(rounds);
    }
    if let Some(secs) = settings.provider_timeout_secs {
        engine = engine.with_provider_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = settings.tool_timeout_secs {
        engine = engine.with_tool_timeout(Duration::from_secs(secs));
    }
    if let Some(parallel) = settings.parallel_tools {
        engine = engine.with_parallel_tools(parallel);
    }
    if let Some(prompt) = &config.system_prompt {
        engine = engine.with_system_prompt(prompt);
    }
    if let Some(model) = &resolved.model {
        engine = engine.with_model(model);
    }
    if let Some(max_tokens) = resolved.max_tokens {
        engine = engine.with_max_tokens(max_tokens);
    }
    if let Some(temperature) = resolved.temperature {
        engine = engine.with_temperature(temperature);
    }
    engine
}

pub fn unwrap_rules(settings: Option<&UnwrapSettings>) -> UnwrapRules {
    let mut rules = UnwrapRules::default();
    let Some(settings) = settings else {
        return rules;
    };

    if let Some(keys) = &settings.text_keys {
        rules.text_keys = keys.clone();
    }
    rules.text_keys.extend(settings.extra_text_keys.iter().cloned());
    if let Some(single) = settings.single_field {
        rules.single_field = single;
    }
    if let Some(depth) = settings.max_depth {
        rules.max_depth = depth;
    }
    if let Some(fences) = settings.strip_code_fences {
        rules.strip_code_fences = fences;
    }
    if let Some(keys) = &settings.name_keys {
        rules.name_keys = keys.clone();
    }
    if let Some(keys) = &settings.argument_keys {
        rules.argument_keys = keys.clone();
    }
    rules
}
