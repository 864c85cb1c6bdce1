//! Structured logging utilities for unxip components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use unxip_config::logging::*;
//!
//! log_cli_info!("Extraction started", input = %path.display());
//! log_cli_debug!("Effective options", threads = 8);
//! ```

use std::fmt;
use std::str::FromStr;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const CLI: &'static str = "CLI";
    pub const CONFIG: &'static str = "CONFIG";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Step `delta` levels towards `Trace` (positive) or `Error` (negative).
    pub fn shifted(self, delta: i32) -> LogLevel {
        const ORDER: [LogLevel; 5] = [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ];
        let index = (self as i32 + delta).clamp(0, ORDER.len() as i32 - 1);
        ORDER[index as usize]
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::info!(component = $crate::logging::Component::CLI, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_cli_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = $crate::logging::Component::CLI, $($($field)+,)? $msg)
    };
}

#[macro_export]
macro_rules! log_cli_warn {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::warn!(component = $crate::logging::Component::CLI, $($($field)+,)? $msg)
    };
}

// === CONFIG logging macros ===

#[macro_export]
macro_rules! log_config_debug {
    ($msg:literal $(, $($field:tt)+)?) => {
        tracing::debug!(component = $crate::logging::Component::CONFIG, $($($field)+,)? $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
///
/// `UNXIP_LOG` takes precedence, then `RUST_LOG`, then `level`. Output goes
/// to stderr so it never mixes with data written to stdout.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env("UNXIP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
