use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Where task definitions and run logs are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. Defaults to `~/.backman/backman.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the database path, falling back to the config directory.
    pub fn resolve_db_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("backman.db")),
        }
    }
}

/// Which external program performs the recursive copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyToolConfig {
    /// `xcopy` on Windows, `cp` elsewhere.
    #[default]
    Auto,
    Xcopy,
    Cp,
    /// Arbitrary program; `{source}` and `{destination}` in `args` are substituted.
    Command { program: String, args: Vec<String> },
}

/// Execution engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard wall-clock limit for one copy.
    #[serde(default = "default_copy_timeout_secs")]
    pub copy_timeout_secs: u64,
    /// Upper bound on copies running at the same time.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Run logs older than this are pruned.
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
    #[serde(default)]
    pub copy_tool: CopyToolConfig,
}

fn default_copy_timeout_secs() -> u64 {
    3600
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_log_retention_days() -> u32 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            copy_timeout_secs: default_copy_timeout_secs(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            log_retention_days: default_log_retention_days(),
            copy_tool: CopyToolConfig::default(),
        }
    }
}

/// Failure notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Addresses that should hear about failed backups.
    #[serde(default)]
    pub recipients: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recipients: Vec::new(),
        }
    }
}

/// Top-level backman configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackmanConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Resolve the backman config directory (~/.backman/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".backman"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.backman/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<BackmanConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<BackmanConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(BackmanConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: BackmanConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Save configuration to the default path.
pub fn save_config(config: &BackmanConfig) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    save_config_to(config, &dir.join("config.json5"))
}

/// Save configuration to a specific path.
pub fn save_config_to(config: &BackmanConfig, path: &Path) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}
