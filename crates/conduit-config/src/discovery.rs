//! Config file discovery and layered merging.
//!
//! Layers, later overriding earlier:
//! 1. `$CONDUIT_CONFIG_DIR/config.toml`, or `<config_dir>/conduit/config.toml`
//! 2. `./conduit.toml`, or `./mcp-server-config.json` when that is absent
//!
//! An explicit path (`--config`) skips discovery entirely.

use std::path::{Path, PathBuf};

use crate::{legacy, ConduitConfig, ConfigError, Result};

const PROJECT_CONFIG_FILE: &str = "conduit.toml";
const LEGACY_CONFIG_FILE: &str = "mcp-server-config.json";
const USER_CONFIG_FILE: &str = "config.toml";
const APP_NAME: &str = "conduit";

/// Overrides the platform config directory.
const CONFIG_DIR_ENV: &str = "CONDUIT_CONFIG_DIR";

/// One file that discovery looked at.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    /// Whether the file was found and merged.
    pub loaded: bool,
}

/// The merged configuration plus where it came from.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub config: ConduitConfig,
    /// Files checked, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// Non-fatal problems: unreadable layers, plaintext keys.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Paths of the layers that were actually merged.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Discover and merge the user and project layers.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Discovery with an explicit user config directory (ignores the environment).
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut loaded = LoadedConfig::default();

    let user_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => user_config_path(),
    };
    if let Some(path) = user_path {
        merge_layer(&mut loaded, path);
    }

    let project = project_dir.map(Path::to_path_buf).unwrap_or_default();
    let native = project.join(PROJECT_CONFIG_FILE);
    if native.is_file() {
        merge_layer(&mut loaded, native);
    } else {
        merge_layer(&mut loaded, project.join(LEGACY_CONFIG_FILE));
    }

    check_plaintext_keys(&loaded.config, &mut loaded.warnings);
    Ok(loaded)
}

/// Load exactly one file, bypassing discovery. Errors are returned, not downgraded.
pub fn load_config_from(path: &Path) -> Result<LoadedConfig> {
    let config = load_config_file(path)?;
    let mut warnings = Vec::new();
    check_plaintext_keys(&config, &mut warnings);
    Ok(LoadedConfig {
        config,
        sources: vec![ConfigSource {
            path: path.to_path_buf(),
            loaded: true,
        }],
        warnings,
    })
}

/// Parse one file. `.json` files are read in the legacy format.
pub fn load_config_file(path: &Path) -> Result<ConduitConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => legacy::from_legacy_json(&contents),
        _ => ConduitConfig::from_toml(&contents),
    }
}

/// Write a config as TOML, creating parent directories.
pub fn save_config(config: &ConduitConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
            path: parent.display().to_string(),
            source: e,
        })?;
    }
    std::fs::write(path, config.to_toml()?).map_err(|e| ConfigError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })
}

/// `config.toml` inside [`user_config_dir`].
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// `$CONDUIT_CONFIG_DIR` when set and non-empty, else the platform config dir.
pub fn user_config_dir() -> Option<PathBuf> {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|d| d.join(APP_NAME)),
    }
}

fn merge_layer(loaded: &mut LoadedConfig, path: PathBuf) {
    let mut was_loaded = false;
    if path.is_file() {
        match load_config_file(&path) {
            Ok(layer) => {
                loaded.config.merge(layer);
                was_loaded = true;
            }
            Err(e) => loaded
                .warnings
                .push(format!("Failed to load {}: {}", path.display(), e)),
        }
    }
    loaded.sources.push(ConfigSource {
        path,
        loaded: was_loaded,
    });
}

fn check_plaintext_keys(config: &ConduitConfig, warnings: &mut Vec<String>) {
    for (name, provider) in &config.providers {
        if provider.has_plaintext_api_key() {
            warnings.push(format!(
                "[providers.{}] contains a plaintext API key. \
                 Consider api_key_ref or an environment variable instead.",
                name
            ));
        }
    }
}
