//! Configuration system for Conduit.
//!
//! Provides TOML-based configuration with:
//! - Named provider tables (`[providers.claude]`, `[providers.local]`, ...)
//! - Config file layering (user config + project-local overrides)
//! - The legacy `mcp-server-config.json` format
//! - API key resolution (key ref → provider env var → config file)

pub mod discovery;
pub mod error;
pub mod legacy;
pub mod resolver;
pub mod secrets;
pub mod types;

pub use discovery::{
    load_config, load_config_file, load_config_from, load_config_with_options, save_config,
    user_config_dir, user_config_path, ConfigSource, LoadedConfig,
};
pub use error::{ConfigError, Result};
pub use legacy::from_legacy_json;
pub use resolver::{resolve_provider, resolve_provider_with, ResolvedProvider};
pub use secrets::{resolve_api_key, ResolvedSecret, SecretSource};
pub use types::*;
