//! The legacy `mcp-server-config.json` format.
//!
//! ```json
//! {
//!   "systemPrompt": "...",
//!   "llm": { "provider": "openai", "model": "gpt-4o-mini", "api_key": "...", "temperature": 0 },
//!   "mcpServers": { "sqlite": { "command": "uvx", "args": ["mcp-server-sqlite"], "env": {} } }
//! }
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::{
    ConduitConfig, ConfigError, McpConfig, McpServerEntry, ProviderConfig, ProviderKind,
    ProviderSection, Result,
};

const DEFAULT_PROVIDER: &str = "openai";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LegacyConfig {
    system_prompt: Option<String>,
    llm: Option<LegacyLlm>,
    mcp_servers: BTreeMap<String, LegacyServer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyLlm {
    provider: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LegacyServer {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Parse a legacy JSON config into the native representation.
pub fn from_legacy_json(json: &str) -> Result<ConduitConfig> {
    let legacy: LegacyConfig = serde_json::from_str(json)?;
    let mut config = ConduitConfig::new();
    config.system_prompt = legacy.system_prompt;

    let llm = legacy.llm.unwrap_or_default();
    let name = llm
        .provider
        .map(|p| p.to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
    let kind = ProviderKind::from_name(&name)
        .ok_or_else(|| ConfigError::invalid("llm.provider", format!("unknown provider '{name}'")))?;

    let provider = ProviderConfig {
        kind: Some(kind),
        model: Some(llm.model.unwrap_or_else(|| DEFAULT_MODEL.to_string())),
        api_key: llm.api_key.filter(|k| !k.is_empty()),
        base_url: llm.base_url,
        temperature: Some(llm.temperature.unwrap_or(0.0)),
        max_tokens: llm.max_tokens,
        ..ProviderConfig::default()
    };
    config.providers.insert(name.clone(), provider);
    config.provider = Some(ProviderSection {
        default: Some(name),
    });

    if !legacy.mcp_servers.is_empty() {
        let servers = legacy
            .mcp_servers
            .into_iter()
            .map(|(name, server)| {
                let mut entry = McpServerEntry::new(name, server.command).with_args(server.args);
                entry.env = server.env;
                entry
            })
            .collect();
        config.mcp = Some(McpConfig {
            enabled: true,
            servers,
        });
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_legacy_file() {
        let config = from_legacy_json(
            r#"{
                "systemPrompt": "You answer questions about the sales database.",
                "llm": { "provider": "Groq", "model": "llama-3.1-70b", "api_key": "gsk" },
                "mcpServers": {
                    "sqlite": {
                        "command": "uvx",
                        "args": ["mcp-server-sqlite", "--db-path", "sales.db"],
                        "env": { "PATH": "" }
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.default_provider(), Some("groq"));
        let groq = &config.providers["groq"];
        assert_eq!(groq.kind, Some(ProviderKind::Groq));
        assert_eq!(groq.model.as_deref(), Some("llama-3.1-70b"));
        assert_eq!(groq.temperature, Some(0.0));
        assert!(groq.has_plaintext_api_key());

        let servers = config.mcp_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].command, "uvx");
        assert_eq!(servers[0].env["PATH"], "");
    }

    #[test]
    fn test_defaults_when_llm_missing() {
        let config = from_legacy_json("{}").unwrap();
        let openai = &config.providers["openai"];
        assert_eq!(openai.model.as_deref(), Some("gpt-4o-mini"));
        assert!(config.mcp.is_none());
        assert!(config.system_prompt.is_none());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = from_legacy_json(r#"{"llm": {"provider": "palm"}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
