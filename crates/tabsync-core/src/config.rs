//! Sync configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/tabsync/config.toml)
//! 3. Environment variables (TABSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable prefix
const ENV_PREFIX: &str = "TABSYNC";

/// Tuning knobs for persistence and compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory for the persistence database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// How often buffered changes are flushed to storage
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Rewrite the snapshot after this many flushes
    #[serde(default = "default_compact_every")]
    pub compact_every: u32,

    /// Rewrite the snapshot once the change log exceeds this many bytes
    #[serde(default = "default_compact_bytes")]
    pub compact_bytes: u64,

    /// Attempts per storage write before the client gives up
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,

    /// First retry delay; doubles per attempt
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,

    /// Ceiling for the doubled retry delay
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            flush_interval_ms: default_flush_interval_ms(),
            compact_every: default_compact_every(),
            compact_bytes: default_compact_bytes(),
            max_write_retries: default_max_write_retries(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (TABSYNC_DATA_DIR, TABSYNC_FLUSH_INTERVAL_MS, ...)
    /// 2. Config file (~/.config/tabsync/config.toml or TABSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: SyncConfig =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_FLUSH_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(parsed) = val.parse() {
                self.flush_interval_ms = parsed;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_COMPACT_EVERY", ENV_PREFIX)) {
            if let Ok(parsed) = val.parse() {
                self.compact_every = parsed;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_COMPACT_BYTES", ENV_PREFIX)) {
            if let Ok(parsed) = val.parse() {
                self.compact_bytes = parsed;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_MAX_WRITE_RETRIES", ENV_PREFIX)) {
            if let Ok(parsed) = val.parse() {
                self.max_write_retries = parsed;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_INITIAL_RETRY_DELAY_MS", ENV_PREFIX)) {
            if let Ok(parsed) = val.parse() {
                self.initial_retry_delay_ms = parsed;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_MAX_RETRY_DELAY_MS", ENV_PREFIX)) {
            if let Ok(parsed) = val.parse() {
                self.max_retry_delay_ms = parsed;
            }
        }
    }

    /// Ensure data directory exists
    pub fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir).with_context(|| {
                format!("Failed to create data directory: {:?}", self.data_dir)
            })?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with TABSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tabsync")
            .join("config.toml")
    }

    /// Get the path to the persistence database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("documents.db")
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tabsync")
}

fn default_flush_interval_ms() -> u64 {
    500
}

fn default_compact_every() -> u32 {
    64
}

fn default_compact_bytes() -> u64 {
    1024 * 1024
}

fn default_max_write_retries() -> u32 {
    5
}

fn default_initial_retry_delay_ms() -> u64 {
    100
}

fn default_max_retry_delay_ms() -> u64 {
    5_000
}
