//! Logging setup for binaries and examples built on this crate.
//!
//! The library only emits `tracing` events; installing a subscriber is left to the
//! application. [`init_logging`] is a convenience that installs one with an `EnvFilter`
//! and either JSON or pretty output.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt as tracing_fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable, multi-line output.
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(LogError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset, e.g. `"info,tower_admit=debug"`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("Unknown log format `{0}`; expected `json` or `pretty`")]
    UnknownFormat(String),
    #[error("Subscriber already initialized")]
    AlreadyInitialized,
}

/// Install a global subscriber. `RUST_LOG`, when set, overrides `config.level`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| LogError::InvalidFilter(e.to_string()))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry.with(tracing_fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_fmt::layer().pretty()).try_init(),
    };
    installed.map_err(|_| LogError::AlreadyInitialized)
}
