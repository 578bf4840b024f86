//! Logger module for weft
//!
//! Simple logging: `[LEVEL] message`, filtered by level or by an
//! `EnvFilter` directive taken from `WEFT_LOG`.
//!
//! # Usage
//!
//! ```rust
//! use weft::util::logger;
//!
//! logger::init();
//! tracing::info!("Hello, {}", "world");
//! ```

use std::str::FromStr;

use tracing_subscriber::fmt::{
    self,
    format::{Compact, DefaultFields, Format},
};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// Environment variable holding a filter directive, e.g. `weft=trace`.
pub const ENV_LOG: &str = "WEFT_LOG";

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level `{}`", other)),
        }
    }
}

/// Initialize logger with default configuration (INFO level)
pub fn init() {
    init_with_level(LogLevel::Info);
}

/// Initialize logger with custom level
pub fn init_with_level(level: LogLevel) {
    let _ = try_init_with_level(level);
}

/// Like [`init_with_level`], but reports whether a global subscriber was
/// already installed instead of ignoring it.
pub fn try_init_with_level(level: LogLevel) -> Result<(), TryInitError> {
    let filter = LevelFilter::from_level(level.into());
    Registry::default()
        .with(plain_format().with_filter(filter))
        .try_init()
}

/// Initialize logger from `WEFT_LOG`, falling back to `default_directive`
/// (for example the configured `log_level`) when the variable is unset or
/// invalid.
pub fn init_from_env(default_directive: &str) {
    let filter = EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = Registry::default()
        .with(plain_format().with_filter(filter))
        .try_init();
}

// 不显示时间、不显示模块路径、无颜色
fn plain_format() -> fmt::Layer<Registry, DefaultFields, Format<Compact, ()>> {
    fmt::layer()
        .without_time()
        .with_target(false)
        .with_level(true)
        .with_ansi(false)
        .compact()
}

/// Initialize logger for debug use (DEBUG level)
pub fn init_debug() {
    init_with_level(LogLevel::Debug);
}
