//! Provider selection and adapter construction.

use std::sync::Arc;
use std::time::Duration;

use crate::adapter::SharedAdapter;
use crate::anthropic::{AnthropicAdapter, AnthropicConfig};
use crate::error::{LlmError, Result};
use crate::openai::{OpenAiAdapter, OpenAiConfig};

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Anthropic Messages API
    Anthropic,
    /// OpenAI Chat Completions
    OpenAi,
    /// Groq cloud inference (OpenAI-compatible)
    Groq,
    /// Local model server (OpenAI-compatible, e.g. Ollama)
    Local,
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Groq => "groq",
            Provider::Local => "local",
        }
    }

    /// Parse a provider from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "anthropic" | "claude" => Some(Provider::Anthropic),
            "openai" | "gpt" => Some(Provider::OpenAi),
            "groq" => Some(Provider::Groq),
            "local" | "ollama" => Some(Provider::Local),
            _ => None,
        }
    }

    /// Check if this provider requires an API key.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Provider::Local)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Everything needed to build one adapter, with credentials already resolved.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub provider: Provider,
    /// Model override; the provider preset's default when `None`.
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl ProviderSettings {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            model: None,
            api_key: None,
            base_url: None,
            timeout: None,
            max_retries: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn require_key(&self) -> Result<String> {
        self.api_key.clone().ok_or_else(|| {
            LlmError::Config(format!("{} provider requires an API key", self.provider))
        })
    }
}

/// Build the adapter variant named by `settings.provider`.
pub fn create_adapter(settings: ProviderSettings) -> Result<SharedAdapter> {
    let adapter: SharedAdapter = match settings.provider {
        Provider::Anthropic => {
            let mut config = AnthropicConfig::new(settings.require_key()?);
            if let Some(model) = &settings.model {
                config = config.with_model(model);
            }
            if let Some(url) = &settings.base_url {
                config = config.with_base_url(url);
            }
            if let Some(timeout) = settings.timeout {
                config = config.with_timeout(timeout);
            }
            if let Some(retries) = settings.max_retries {
                config = config.with_max_retries(retries);
            }
            Arc::new(AnthropicAdapter::new(config)?)
        }
        Provider::OpenAi | Provider::Groq | Provider::Local => {
            let mut config = match settings.provider {
                Provider::Groq => OpenAiConfig::groq(settings.require_key()?),
                Provider::Local => OpenAiConfig::local(),
                _ => OpenAiConfig::openai(settings.require_key()?),
            };
            if settings.provider == Provider::Local {
                config.api_key = settings.api_key.clone();
            }
            if let Some(model) = &settings.model {
                config = config.with_model(model);
            }
            if let Some(url) = &settings.base_url {
                config = config.with_base_url(url);
            }
            if let Some(timeout) = settings.timeout {
                config = config.with_timeout(timeout);
            }
            if let Some(retries) = settings.max_retries {
                config = config.with_max_retries(retries);
            }
            Arc::new(OpenAiAdapter::new(config)?)
        }
    };

    tracing::info!(
        provider = %settings.provider,
        model = %adapter.model(),
        "created provider adapter"
    );
    Ok(adapter)
}
