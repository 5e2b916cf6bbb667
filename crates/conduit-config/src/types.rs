//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! system_prompt = "..."
//! [engine]                 # round limit, timeouts
//! [engine.unwrap]          # decoder envelope rules
//! [provider]               # default = "<name>"
//! [providers.<name>]       # one table per configured provider
//! [[mcp.servers]]          # tool servers
//! [server]                 # HTTP bind address
//! [logging]                # level, log file
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitConfig {
    /// System prompt sent with every query.
    pub system_prompt: Option<String>,

    /// Orchestration engine settings.
    pub engine: Option<EngineSettings>,

    /// Provider selection (`[provider] default = "..."`).
    pub provider: Option<ProviderSection>,

    /// Named provider configurations (`[providers.anthropic]`, ...).
    pub providers: BTreeMap<String, ProviderConfig>,

    /// MCP tool servers.
    pub mcp: Option<McpConfig>,

    /// HTTP server settings.
    pub server: Option<ServerConfig>,

    /// Logging settings.
    pub logging: Option<LoggingConfig>,
}

impl ConduitConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: ConduitConfig) {
        if other.system_prompt.is_some() {
            self.system_prompt = other.system_prompt;
        }

        if other.engine.is_some() {
            self.engine = other.engine;
        }

        if other.provider.is_some() {
            self.provider = other.provider;
        }

        for (name, config) in other.providers {
            self.providers.insert(name, config);
        }

        if other.mcp.is_some() {
            self.mcp = other.mcp;
        }

        if other.server.is_some() {
            self.server = other.server;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Name of the default provider, if one is set or can be inferred.
    ///
    /// With no explicit default, a config with exactly one provider uses it.
    pub fn default_provider(&self) -> Option<&str> {
        if let Some(name) = self.provider.as_ref().and_then(|p| p.default.as_deref()) {
            return Some(name);
        }
        match self.providers.len() {
            1 => self.providers.keys().next().map(String::as_str),
            _ => None,
        }
    }

    /// Enabled MCP servers, in file order.
    pub fn mcp_servers(&self) -> Vec<&McpServerEntry> {
        match &self.mcp {
            Some(mcp) if mcp.enabled => mcp.servers.iter().filter(|s| s.enabled).collect(),
            _ => Vec::new(),
        }
    }

    /// Engine settings, or defaults when the section is absent.
    pub fn engine_settings(&self) -> EngineSettings {
        self.engine.clone().unwrap_or_default()
    }

    /// Server settings, or defaults when the section is absent.
    pub fn server_settings(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Settings
// ─────────────────────────────────────────────────────────────────────────────

/// `[engine]` section. Unset values fall back to the engine's own defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Tool-call rounds allowed per query.
    pub max_rounds: Option<u32>,
    /// Deadline for one provider call, in seconds.
    pub provider_timeout_secs: Option<u64>,
    /// Timeout for one tool invocation, in seconds.
    pub tool_timeout_secs: Option<u64>,
    /// Run the tool calls of one round concurrently.
    pub parallel_tools: Option<bool>,
    /// Decoder envelope rules.
    pub unwrap: Option<UnwrapSettings>,
}

/// `[engine.unwrap]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnwrapSettings {
    /// Replaces the default text-bearing keys.
    pub text_keys: Option<Vec<String>>,
    /// Added to the text-bearing keys (default or replaced).
    pub extra_text_keys: Vec<String>,
    pub single_field: Option<bool>,
    pub max_depth: Option<usize>,
    pub strip_code_fences: Option<bool>,
    pub name_keys: Option<Vec<String>>,
    pub argument_keys: Option<Vec<String>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// `[provider]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// Name of the provider table used when none is requested.
    pub default: Option<String>,
}

/// Configuration for one provider (`[providers.<name>]`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider kind; inferred from the table name when omitted.
    pub kind: Option<ProviderKind>,
    /// Model identifier.
    pub model: Option<String>,
    /// Where to find the API key: `env:NAME` or a bare variable name.
    pub api_key_ref: Option<String>,
    /// API key (prefer `api_key_ref`; warns if set here).
    pub api_key: Option<String>,
    /// Custom API base URL (for proxies, local servers).
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// HTTP timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Retries when opening a stream fails with a retryable error.
    pub max_retries: Option<u32>,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_api_key_ref(mut self, reference: impl Into<String>) -> Self {
        self.api_key_ref = Some(reference.into());
        self
    }

    /// Returns true if an API key is stored directly in the config file.
    pub fn has_plaintext_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Supported provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    Openai,
    Groq,
    /// OpenAI-compatible local server such as Ollama.
    #[serde(alias = "ollama")]
    Local,
}

impl ProviderKind {
    /// Environment variable name for this provider's API key.
    pub fn env_var(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::Openai => "OPENAI_API_KEY",
            ProviderKind::Groq => "GROQ_API_KEY",
            ProviderKind::Local => "OLLAMA_API_KEY",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Openai => "openai",
            ProviderKind::Groq => "groq",
            ProviderKind::Local => "local",
        }
    }

    /// Parse a kind from a provider or table name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(ProviderKind::Anthropic),
            "openai" | "gpt" => Some(ProviderKind::Openai),
            "groq" => Some(ProviderKind::Groq),
            "local" | "ollama" => Some(ProviderKind::Local),
            _ => None,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderKind::Local)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MCP Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// `[mcp]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// Whether MCP is enabled globally.
    pub enabled: bool,
    /// Configured MCP servers.
    pub servers: Vec<McpServerEntry>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: Vec::new(),
        }
    }
}

/// Transport type for MCP server connections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportType {
    /// Spawn a child process and talk over stdin/stdout.
    #[default]
    Stdio,
    /// Connect to a remote server via HTTP POST.
    Http,
}

/// One `[[mcp.servers]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerEntry {
    /// Unique name for this server (used in tool namespacing).
    pub name: String,
    #[serde(default)]
    pub transport: McpTransportType,
    /// Command to execute (stdio).
    #[serde(default)]
    pub command: String,
    /// Server URL (HTTP).
    pub url: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Child environment. An empty value inherits from the parent process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// HTTP headers (HTTP).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request timeout in seconds. Defaults to 30.
    pub timeout_secs: Option<u64>,
    /// Number of retries (HTTP). Defaults to 3.
    pub retries: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl McpServerEntry {
    /// A stdio server entry.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: McpTransportType::Stdio,
            command: command.into(),
            url: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            headers: BTreeMap::new(),
            timeout_secs: None,
            retries: None,
            enabled: true,
        }
    }

    /// An HTTP server entry.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: McpTransportType::Http,
            url: Some(url.into()),
            ..Self::new(name, String::new())
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn is_http(&self) -> bool {
        self.transport == McpTransportType::Http
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server & Logging
// ─────────────────────────────────────────────────────────────────────────────

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind: String,
    /// Port to listen on.
    pub port: u16,
}

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `conduit_engine=debug`.
    pub level: Option<String>,
    /// Directory for daily-rotated JSON log files.
    pub file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
system_prompt = "You are a helpful data assistant."

[engine]
max_rounds = 4
tool_timeout_secs = 10

[engine.unwrap]
extra_text_keys = ["haiku"]
single_field = false

[provider]
default = "claude"

[providers.claude]
kind = "anthropic"
model = "claude-3-5-sonnet-latest"
api_key_ref = "env:MY_CLAUDE_KEY"
max_tokens = 2048

[providers.ollama]
model = "llama3.1"
base_url = "http://localhost:11434/v1"

[[mcp.servers]]
name = "sqlite"
command = "uvx"
args = ["mcp-server-sqlite", "--db-path", "test.db"]

[[mcp.servers]]
name = "search"
transport = "http"
url = "http://localhost:9000/mcp"
headers = { Authorization = "Bearer x" }
enabled = false

[server]
port = 9090

[logging]
level = "debug"
file = "/tmp/conduit-logs"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = ConduitConfig::from_toml(FULL).unwrap();
        assert_eq!(
            config.system_prompt.as_deref(),
            Some("You are a helpful data assistant.")
        );

        let engine = config.engine_settings();
        assert_eq!(engine.max_rounds, Some(4));
        assert_eq!(engine.provider_timeout_secs, None);
        let unwrap = engine.unwrap.unwrap();
        assert_eq!(unwrap.extra_text_keys, vec!["haiku".to_string()]);
        assert_eq!(unwrap.single_field, Some(false));

        assert_eq!(config.default_provider(), Some("claude"));
        let claude = &config.providers["claude"];
        assert_eq!(claude.kind, Some(ProviderKind::Anthropic));
        assert_eq!(claude.max_tokens, Some(2048));
        assert_eq!(config.providers["ollama"].kind, None);

        let servers = config.mcp_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "sqlite");
        assert_eq!(servers[0].args.len(), 3);
        assert!(!servers[0].is_http());

        let all = &config.mcp.as_ref().unwrap().servers;
        assert!(all[1].is_http());
        assert_eq!(all[1].headers["Authorization"], "Bearer x");

        assert_eq!(config.server_settings().port, 9090);
        assert_eq!(config.server_settings().bind, DEFAULT_BIND);
        assert_eq!(
            config.logging.unwrap().file,
            Some(PathBuf::from("/tmp/conduit-logs"))
        );
    }

    #[test]
    fn test_toml_roundtrip_preserves_providers() {
        let config = ConduitConfig::from_toml(FULL).unwrap();
        let reparsed = ConduitConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_merge_overrides_sections() {
        let mut base = ConduitConfig::from_toml(FULL).unwrap();
        let overlay = ConduitConfig::from_toml(
            r#"
[provider]
default = "fast"

[providers.fast]
kind = "groq"

[server]
port = 3000
"#,
        )
        .unwrap();
        base.merge(overlay);

        assert_eq!(base.default_provider(), Some("fast"));
        assert_eq!(base.providers.len(), 3);
        assert_eq!(base.server_settings().port, 3000);
        assert!(base.system_prompt.is_some());
        assert_eq!(base.mcp_servers().len(), 1);
    }

    #[test]
    fn test_single_provider_is_default() {
        let config = ConduitConfig::from_toml("[providers.groq]\nmodel = \"m\"\n").unwrap();
        assert_eq!(config.default_provider(), Some("groq"));
        assert_eq!(ConduitConfig::new().default_provider(), None);
    }

    #[test]
    fn test_provider_kind_names() {
        assert_eq!(ProviderKind::from_name("Ollama"), Some(ProviderKind::Local));
        assert_eq!(ProviderKind::from_name("claude"), Some(ProviderKind::Anthropic));
        assert_eq!(ProviderKind::from_name("mistral"), None);
        assert_eq!(ProviderKind::Groq.env_var(), "GROQ_API_KEY");
        assert!(!ProviderKind::Local.requires_api_key());

        let parsed: ProviderConfig = toml::from_str("kind = \"ollama\"").unwrap();
        assert_eq!(parsed.kind, Some(ProviderKind::Local));
    }

    #[test]
    fn test_disabled_mcp_section() {
        let config = ConduitConfig::from_toml(
            r#"
[mcp]
enabled = false

[[mcp.servers]]
name = "sqlite"
command = "uvx"
"#,
        )
        .unwrap();
        assert!(config.mcp_servers().is_empty());
    }
}
