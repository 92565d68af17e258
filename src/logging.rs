//! Logging setup for drvstream.
//!
//! All diagnostics go to stderr; stdout is reserved for the result stream.
//!
//! # Environment variables
//!
//! - `DRVSTREAM_LOG` - log filter (overrides `RUST_LOG`)
//! - `DRVSTREAM_LOG_LEVEL` - log level: error, warn, info, debug, trace
//! - `DRVSTREAM_LOG_FORMAT` - output format: pretty, compact, json
//! - `RUST_LOG` - standard Rust log filter (fallback)

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format: '{}', valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Logging configuration assembled from the CLI and the environment.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN, the coordinator is quiet by default).
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Custom filter string (overrides level if set).
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Pretty,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Apply environment variable overrides. CLI arguments take precedence:
    /// values already set are not replaced.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("DRVSTREAM_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none() {
            if let Ok(level) = std::env::var("DRVSTREAM_LOG_LEVEL") {
                if let Some(level) = parse_level(&level) {
                    self.level = level;
                }
            }
        }

        if let Ok(format) = std::env::var("DRVSTREAM_LOG_FORMAT") {
            if let Ok(format) = format.parse() {
                self.format = format;
            }
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("warning: invalid log filter '{}', using default", filter);
                EnvFilter::new(self.level.to_string().to_lowercase())
            }),
            None => EnvFilter::new(self.level.to_string().to_lowercase()),
        }
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global tracing subscriber. Idempotent: later calls are
/// silently ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let result = match config.format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
        }
        LogFormat::Compact => {
            let layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
        }
        LogFormat::Pretty => {
            let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
        }
    };

    let _ = result;
}
