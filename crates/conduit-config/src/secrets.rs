//! API key lookup.
//!
//! Resolution order:
//! 1. The provider's `api_key_ref` (`env:NAME` or a bare variable name)
//! 2. The provider kind's standard environment variable
//! 3. Inline `api_key` in the config file (with warning at load time)

use crate::ProviderKind;

/// Result of API key resolution with provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    /// The secret value.
    pub value: String,
    /// Where the secret was found.
    pub source: SecretSource,
}

/// Where a secret was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Environment variable.
    EnvVar(String),
    /// Config file (plaintext, not recommended).
    ConfigFile,
}

impl std::fmt::Display for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretSource::EnvVar(var) => write!(f, "env var {}", var),
            SecretSource::ConfigFile => write!(f, "config file (plaintext)"),
        }
    }
}

/// Resolve an API key against the process environment.
pub fn resolve_api_key(
    kind: ProviderKind,
    key_ref: Option<&str>,
    config_value: Option<&str>,
) -> Option<ResolvedSecret> {
    resolve_api_key_with(kind, key_ref, config_value, |name| std::env::var(name).ok())
}

/// Resolve an API key with a caller-supplied environment lookup.
pub fn resolve_api_key_with<F>(
    kind: ProviderKind,
    key_ref: Option<&str>,
    config_value: Option<&str>,
    lookup: F,
) -> Option<ResolvedSecret>
where
    F: Fn(&str) -> Option<String>,
{
    let from_env = |var: &str| {
        lookup(var)
            .filter(|value| !value.is_empty())
            .map(|value| ResolvedSecret {
                value,
                source: SecretSource::EnvVar(var.to_string()),
            })
    };

    if let Some(var) = key_ref.map(ref_variable).filter(|v| !v.is_empty()) {
        if let Some(secret) = from_env(var) {
            return Some(secret);
        }
    }

    if let Some(secret) = from_env(kind.env_var()) {
        return Some(secret);
    }

    config_value
        .filter(|v| !v.is_empty())
        .map(|v| ResolvedSecret {
            value: v.to_string(),
            source: SecretSource::ConfigFile,
        })
}

/// Variable named by an `api_key_ref`.
fn ref_variable(reference: &str) -> &str {
    reference
        .strip_prefix("env:")
        .unwrap_or(reference)
        .trim()
}
