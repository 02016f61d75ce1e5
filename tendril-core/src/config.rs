use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::error::TendrilError;
use crate::plugins::Capability;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigLoadError> for TendrilError {
    fn from(err: ConfigLoadError) -> Self {
        match err {
            ConfigLoadError::Config(e) => e.into(),
            ConfigLoadError::InvalidValue { key, message } => {
                TendrilError::InvalidConfigValue { key, message }
            }
            ConfigLoadError::Io(e) => e.into(),
        }
    }
}

/// Host configuration for the plugin runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TendrilConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub sandbox: SandboxLimitsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Plugin id to granted capability tags. Tags under the `default` key
    /// are granted to every plugin.
    #[serde(default)]
    pub grants: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json_format: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default = "default_plugins_dir")]
    pub dir: String,

    /// Deadline for acquiring the lifecycle coordinator lock.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_lifecycle_timeout")]
    pub start_timeout_ms: u64,

    #[serde(default = "default_lifecycle_timeout")]
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimitsConfig {
    #[serde(default = "default_invocation_timeout")]
    pub invocation_timeout_ms: u64,

    #[serde(default = "default_max_memory")]
    pub max_memory_mb: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_invocations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// A plugin trips once it records more errors than this inside the window.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    #[serde(default = "default_max_handlers")]
    pub max_handlers_per_hook: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_plugins_dir() -> String {
    "plugins".to_string()
}

fn default_lock_timeout() -> u64 {
    5_000
}

fn default_lifecycle_timeout() -> u64 {
    10_000
}

fn default_invocation_timeout() -> u64 {
    5_000
}

fn default_max_memory() -> u64 {
    256
}

fn default_max_concurrent() -> u32 {
    8
}

fn default_error_threshold() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_history_size() -> usize {
    1000
}

fn default_max_handlers() -> usize {
    100
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: default_plugins_dir(),
            lock_timeout_ms: default_lock_timeout(),
            start_timeout_ms: default_lifecycle_timeout(),
            stop_timeout_ms: default_lifecycle_timeout(),
        }
    }
}

impl Default for SandboxLimitsConfig {
    fn default() -> Self {
        Self {
            invocation_timeout_ms: default_invocation_timeout(),
            max_memory_mb: default_max_memory(),
            max_concurrent_invocations: default_max_concurrent(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            window_secs: default_window_secs(),
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            max_handlers_per_hook: default_max_handlers(),
        }
    }
}

impl TendrilConfig {
    pub fn load() -> Result<Self, ConfigLoadError> {
        Self::load_from_paths(get_config_paths())
    }

    pub fn load_from_paths(paths: Vec<PathBuf>) -> Result<Self, ConfigLoadError> {
        load_dotenv_files();

        let mut builder = ConfigBuilder::builder();

        for path in paths {
            if path.exists() {
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        // Nested keys use a double underscore: TENDRIL_HEALTH__ERROR_THRESHOLD=3
        builder = builder.add_source(
            Environment::with_prefix("TENDRIL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;

        let mut tendril_config: TendrilConfig = config.try_deserialize()?;

        if let Ok(level) = std::env::var("TENDRIL_LOG_LEVEL") {
            tendril_config.logging.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            tendril_config.logging.level = level;
        }

        if let Ok(dir) = std::env::var("TENDRIL_PLUGINS_DIR") {
            tendril_config.plugins.dir = dir;
        }

        tendril_config.validate()?;

        Ok(tendril_config)
    }

    /// Parse a configuration document directly, without layering.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigLoadError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, config::FileFormat::Toml))
            .build()?;
        let tendril_config: TendrilConfig = config.try_deserialize()?;
        tendril_config.validate()?;
        Ok(tendril_config)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let positive = [
            ("plugins.lock_timeout_ms", self.plugins.lock_timeout_ms),
            ("plugins.start_timeout_ms", self.plugins.start_timeout_ms),
            ("plugins.stop_timeout_ms", self.plugins.stop_timeout_ms),
            (
                "sandbox.invocation_timeout_ms",
                self.sandbox.invocation_timeout_ms,
            ),
            ("sandbox.max_memory_mb", self.sandbox.max_memory_mb),
            (
                "sandbox.max_concurrent_invocations",
                self.sandbox.max_concurrent_invocations as u64,
            ),
            ("health.window_secs", self.health.window_secs),
            (
                "hooks.max_handlers_per_hook",
                self.hooks.max_handlers_per_hook as u64,
            ),
        ];

        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigLoadError::InvalidValue {
                    key: key.to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        for (plugin, tags) in &self.grants {
            for tag in tags {
                if Capability::from_str(tag).is_err() {
                    return Err(ConfigLoadError::InvalidValue {
                        key: format!("grants.{}", plugin),
                        message: format!("Unknown capability '{}'", tag),
                    });
                }
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let level_lower = self.logging.level.to_lowercase();
        if !valid_levels.contains(&level_lower.as_str()) && !level_lower.contains('=') {
            return Err(ConfigLoadError::InvalidValue {
                key: "logging.level".to_string(),
                message: format!(
                    "Invalid log level '{}'. Must be one of: {:?}",
                    self.logging.level, valid_levels
                ),
            });
        }

        Ok(())
    }

    pub fn log_level(&self) -> &str {
        &self.logging.level
    }

    pub fn plugins_dir(&self) -> PathBuf {
        PathBuf::from(&self.plugins.dir)
    }
}

fn get_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join("config").join("default.toml"));
        paths.push(cwd.join("config").join("local.toml"));
        paths.push(cwd.join("tendril.toml"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("tendril").join("config.toml"));
    }

    paths
}

fn load_dotenv_files() {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".env"));
        paths.push(cwd.join(".env.local"));
    }

    if let Some(config_dir) = get_config_dir() {
        paths.push(config_dir.join(".env"));
    }

    for path in paths {
        if path.exists() {
            let _ = dotenvy::from_path(&path);
        }
    }
}

pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tendril"))
}

pub fn ensure_config_dir() -> Result<PathBuf, std::io::Error> {
    let config_dir = get_config_dir().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine config directory",
        )
    })?;

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}
