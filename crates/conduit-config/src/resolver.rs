//! Provider resolution: turns a provider name into a concrete, credentialed config.

use crate::secrets::{self, SecretSource};
use crate::{ConduitConfig, ConfigError, ProviderConfig, ProviderKind, Result};

/// A fully resolved provider configuration ready to construct an adapter.
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    /// Table name the provider was resolved from.
    pub name: String,
    pub kind: ProviderKind,
    /// Model identifier; the adapter's own default when `None`.
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Where the API key was resolved from.
    pub api_key_source: Option<SecretSource>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

/// Resolve the provider named `requested`, or the config's default.
pub fn resolve_provider(config: &ConduitConfig, requested: Option<&str>) -> Result<ResolvedProvider> {
    resolve_provider_with(config, requested, |name| std::env::var(name).ok())
}

/// Like [`resolve_provider`] with a caller-supplied environment lookup.
pub fn resolve_provider_with<F>(
    config: &ConduitConfig,
    requested: Option<&str>,
    lookup: F,
) -> Result<ResolvedProvider>
where
    F: Fn(&str) -> Option<String>,
{
    let name = requested
        .or_else(|| config.default_provider())
        .ok_or(ConfigError::NoDefaultProvider)?;

    // A bare kind name works without a table.
    let fallback;
    let provider = match config.providers.get(name) {
        Some(provider) => provider,
        None if ProviderKind::from_name(name).is_some() => {
            fallback = ProviderConfig::default();
            &fallback
        }
        None => {
            return Err(ConfigError::ProviderNotFound {
                name: name.to_string(),
            });
        }
    };

    let kind = provider
        .kind
        .or_else(|| ProviderKind::from_name(name))
        .ok_or_else(|| ConfigError::MissingField {
            field: "kind".to_string(),
            context: format!("providers.{}", name),
        })?;

    let secret = secrets::resolve_api_key_with(
        kind,
        provider.api_key_ref.as_deref(),
        provider.api_key.as_deref(),
        lookup,
    );

    if secret.is_none() && kind.requires_api_key() {
        let env_var = provider
            .api_key_ref
            .as_deref()
            .map(|r| r.strip_prefix("env:").unwrap_or(r).to_string())
            .unwrap_or_else(|| kind.env_var().to_string());
        return Err(ConfigError::ApiKeyNotFound {
            provider: name.to_string(),
            env_var,
        });
    }

    let (api_key, api_key_source) = match secret {
        Some(s) => (Some(s.value), Some(s.source)),
        None => (None, None),
    };

    Ok(ResolvedProvider {
        name: name.to_string(),
        kind,
        model: provider.model.clone(),
        base_url: provider.base_url.clone(),
        api_key,
        api_key_source,
        max_tokens: provider.max_tokens,
        temperature: provider.temperature,
        timeout_secs: provider.timeout_secs,
        max_retries: provider.max_retries,
    })
}
