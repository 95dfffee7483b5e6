//! Configuration management.
//!
//! weft configuration can come from:
//! - Environment variables (WEFT_*)
//! - Config file (~/.config/weft/config.toml)
//!
//! Per-workflow `settings` override the engine section at run time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine defaults
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LogConfig,
}

/// Engine defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Wall-clock budget of one execution (seconds)
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Concurrency bound of a map-mode step without `batch_size`
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Steps allowed to run at once within one execution
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-item bound in map mode (seconds); none when unset
    #[serde(default)]
    pub item_timeout_seconds: Option<u64>,

    /// Bound on evaluating one step's templates (milliseconds)
    #[serde(default = "default_expression_timeout_ms")]
    pub expression_timeout_ms: u64,

    /// Largest accepted map-mode input
    #[serde(default = "default_max_map_items")]
    pub max_map_items: usize,

    /// Save a checkpoint after every resolved step
    #[serde(default = "default_checkpoints")]
    pub checkpoints: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            item_timeout_seconds: None,
            expression_timeout_ms: default_expression_timeout_ms(),
            max_map_items: default_max_map_items(),
            checkpoints: default_checkpoints(),
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn expression_timeout(&self) -> Duration {
        Duration::from_millis(self.expression_timeout_ms)
    }
}

fn default_timeout_seconds() -> u64 {
    3600
}

fn default_batch_size() -> usize {
    crate::engine::DEFAULT_BATCH_SIZE
}

fn default_max_concurrency() -> usize {
    16
}

fn default_expression_timeout_ms() -> u64 {
    5000
}

fn default_max_map_items() -> usize {
    crate::engine::DEFAULT_MAX_MAP_ITEMS
}

fn default_checkpoints() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Primary config file: ~/.config/weft/config.toml
        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Load from an explicit file, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a TOML document; missing sections and keys take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let partial: PartialConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let mut config = Self::default();
        config.apply_partial(partial);
        Ok(config)
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("weft"))
            .unwrap_or_else(|| PathBuf::from(".weft"))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(parsed) = get("WEFT_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            self.engine.timeout_seconds = parsed;
        }
        if let Some(parsed) = get("WEFT_MAX_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.engine.max_concurrency = parsed;
        }
        if let Some(parsed) = get("WEFT_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.engine.batch_size = parsed;
        }
        if let Some(parsed) = get("WEFT_ITEM_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            self.engine.item_timeout_seconds = Some(parsed);
        }
        if let Some(level) = get("WEFT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = get("WEFT_LOG_JSON") {
            self.logging.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(logging) = partial.logging {
            self.logging = logging;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    engine: Option<EngineConfig>,
    logging: Option<LogConfig>,
}
