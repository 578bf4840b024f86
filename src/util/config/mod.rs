//! weft runtime configuration
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. Environment variables (WEFT_EXECUTOR, WEFT_WORKERS, WEFT_LOG)
//! 2. Explicit file passed to `load_from_file`
//! 3. User-level (~/.config/weft/config.toml)
//! 4. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use weft::util::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_toml_str("executor = \"cooperative\"").unwrap();
//! assert_eq!(config.executor.as_str(), "cooperative");
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::memory::DEFAULT_SLAB_SIZE;
use crate::runtime::scheduler::ExecutorKind;
use crate::runtime::task::TaskPriority;

/// Environment variable selecting the executor.
pub const ENV_EXECUTOR: &str = "WEFT_EXECUTOR";
/// Environment variable setting the worker count.
pub const ENV_WORKERS: &str = "WEFT_WORKERS";

/// Upper bound on pool workers.
const MAX_WORKERS: usize = 1024;

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Which executor tasks run on
    #[serde(default)]
    pub executor: ExecutorKind,
    /// Worker threads for the thread pool
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Priority of tasks spawned without an explicit one
    #[serde(default)]
    pub default_priority: TaskPriority,
    /// Slab size of every task allocator, in bytes
    #[serde(default = "default_slab_size")]
    pub slab_size: usize,
    /// Default log filter, overridden by `WEFT_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_slab_size() -> usize {
    DEFAULT_SLAB_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::default(),
            workers: default_workers(),
            default_priority: TaskPriority::default(),
            slab_size: default_slab_size(),
            log_level: default_log_level(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// User-level config if present, else defaults; environment overrides
    /// applied on top.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match get_config_path() {
            Some(path) if path.exists() => Self::load_from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `WEFT_EXECUTOR` / `WEFT_WORKERS` if set.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(
            std::env::var(ENV_EXECUTOR).ok().as_deref(),
            std::env::var(ENV_WORKERS).ok().as_deref(),
        )
    }

    /// Apply override values as they would come from the environment.
    pub fn apply_overrides(
        &mut self,
        executor: Option<&str>,
        workers: Option<&str>,
    ) -> Result<(), ConfigError> {
        if let Some(executor) = executor {
            self.executor = executor
                .parse()
                .map_err(|reason| ConfigError::InvalidValue {
                    key: ENV_EXECUTOR,
                    reason,
                })?;
        }
        if let Some(workers) = workers {
            self.workers = workers
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                    key: ENV_WORKERS,
                    reason: e.to_string(),
                })?;
        }
        self.validate()
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidValue {
                key: "workers",
                reason: format!("must be between 1 and {}, got {}", MAX_WORKERS, self.workers),
            });
        }
        if self.slab_size < 64 {
            return Err(ConfigError::InvalidValue {
                key: "slab_size",
                reason: format!("must be at least 64 bytes, got {}", self.slab_size),
            });
        }
        Ok(())
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Get the user config directory
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config).join("weft"));
    }

    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".config").join("weft"));
    }

    if let Ok(appdata) = std::env::var("APPDATA") {
        return Some(PathBuf::from(appdata).join("weft"));
    }

    None
}

/// Get the user config file path (~/.config/weft/config.toml)
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.toml"))
}

/// Save a configuration to `path`, creating parent directories.
pub fn save_config(
    config: &RuntimeConfig,
    path: impl AsRef<Path>,
) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }
    fs::write(path, config.to_toml_string()?)?;
    Ok(())
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Config serialize error: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests;
