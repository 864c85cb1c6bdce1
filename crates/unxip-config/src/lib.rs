//! # unxip-config
//!
//! Configuration management for unxip.
//!
//! Loads configuration from:
//! 1. `~/.unxip/config.toml` (global)
//! 2. `.unxip/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! Command-line flags are applied on top by the binary.

pub mod logging;
pub mod path;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use logging::{init_logging, Component, LogLevel};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub extract: ExtractConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let mut config =
            Self::load_from(global.as_deref(), Some(Path::new(".unxip/config.toml")))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load and layer the given files; missing files are skipped.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut table = toml::Table::new();
        for path in [global, project].into_iter().flatten() {
            if path.exists() {
                crate::log_config_debug!("Loading config", path = %path.display());
                let contents = std::fs::read_to_string(path)?;
                merge_tables(&mut table, toml::from_str(&contents)?);
            }
        }
        Ok(Config::deserialize(toml::Value::Table(table))?)
    }

    /// Global config path: ~/.unxip/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".unxip/config.toml"))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(threads) = lookup("UNXIP_THREADS") {
            let n = threads.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "UNXIP_THREADS",
                value: threads.clone(),
            })?;
            self.extract.threads = Some(n);
        }
        if let Some(compress) = lookup("UNXIP_COMPRESS") {
            self.extract.compress = parse_bool(&compress).ok_or(ConfigError::InvalidValue {
                key: "UNXIP_COMPRESS",
                value: compress.clone(),
            })?;
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

/// Overlay `other` onto `base`, recursing into tables.
fn merge_tables(base: &mut toml::Table, other: toml::Table) {
    for (key, value) in other {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(overlay)) => {
                merge_tables(existing, overlay)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Extraction configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Decoder and writer threads (None = one per CPU)
    pub threads: Option<usize>,
    /// Write files with transparent compression (macOS only)
    pub compress: bool,
    /// Decoded chunks buffered between decompression and parsing
    pub chunk_buffer: usize,
    /// Bytes of file data buffered ahead of the writers
    pub record_budget: usize,
    /// Size of each read from the archive
    pub read_size: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            threads: None,
            compress: false,
            chunk_buffer: 16,
            record_budget: 1024 * 1024 * 1024,
            read_size: 4 * 1024 * 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Parsed level, falling back to `info` for unknown names.
    pub fn level(&self) -> LogLevel {
        self.level.parse().unwrap_or(LogLevel::Info)
    }
}
