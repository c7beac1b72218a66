//! Logging infrastructure for Wirebase.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
    /// Log file path (if file logging enabled).
    pub file_path: Option<PathBuf>,
    /// Include source location.
    pub source_location: bool,
    /// Include span events.
    pub span_events: bool,
}

/// Log level.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
            LogLevel::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
            LogLevel::Info => tracing_subscriber::filter::LevelFilter::INFO,
            LogLevel::Warn => tracing_subscriber::filter::LevelFilter::WARN,
            LogLevel::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        }
    }
}

impl LogLevel {
    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON structured format.
    Json,
}

impl LogFormat {
    /// Parse from string, falling back to pretty.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            file_path: None,
            source_location: false,
            span_events: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("WIREBASE_LOG_LEVEL") {
            if let Some(l) = LogLevel::parse(&level) {
                config.level = l;
            }
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            if let Some(l) = LogLevel::parse(&level) {
                config.level = l;
            }
        }

        if let Ok(format) = std::env::var("WIREBASE_LOG_FORMAT") {
            config.format = LogFormat::parse(&format);
        }

        if let Ok(file_path) = std::env::var("WIREBASE_LOG_FILE") {
            config.file_path = Some(PathBuf::from(file_path));
        }

        if let Ok(source_location) = std::env::var("WIREBASE_LOG_SOURCE") {
            config.source_location = is_truthy(&source_location);
        }

        if let Ok(span_events) = std::env::var("WIREBASE_LOG_SPANS") {
            config.span_events = is_truthy(&span_events);
        }

        config
    }
}

fn is_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

type Filtered = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Filtered> + Send + Sync>;

fn output_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer().with_writer(writer).with_span_events(span_events);

    match config.format {
        LogFormat::Pretty => layer
            .with_ansi(ansi)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .boxed(),
        LogFormat::Compact => layer.compact().with_ansi(ansi).boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Initialize logging with the given configuration.
///
/// `RUST_LOG` directives take precedence over the configured level.
pub fn init(config: LogConfig) -> Result<(), LogError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let mut layers = vec![output_layer(&config, io::stderr, true)];

    if let Some(file_path) = &config.file_path {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        layers.push(output_layer(&config, Arc::new(file), false));
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .map_err(|e| LogError::InitError(e.to_string()))
}

/// Logging errors.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to initialize logging: {0}")]
    InitError(String),

    #[error("failed to open log file: {0}")]
    FileError(#[from] io::Error),
}

/// Convenience macros re-exported from tracing.
pub use tracing::{debug, error, info, trace, warn};

/// Span and timing helpers.
pub mod spans;

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_log_level_parse() {
        assert!(matches!(LogLevel::parse("info"), Some(LogLevel::Info)));
        assert!(matches!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug)));
        assert!(matches!(LogLevel::parse("Warning"), Some(LogLevel::Warn)));
        assert!(matches!(LogLevel::parse("error"), Some(LogLevel::Error)));
        assert!(LogLevel::parse("invalid").is_none());
    }

    #[test]
    fn test_log_format_parse() {
        assert!(matches!(LogFormat::parse("JSON"), LogFormat::Json));
        assert!(matches!(LogFormat::parse("compact"), LogFormat::Compact));
        assert!(matches!(LogFormat::parse("anything"), LogFormat::Pretty));
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert!(matches!(config.level, LogLevel::Info));
        assert!(matches!(config.format, LogFormat::Pretty));
        assert!(config.file_path.is_none());
        assert!(!config.source_location);
        assert!(!config.span_events);
    }

    // Single test touching the environment so parallel tests never race on it.
    #[test]
    fn test_config_from_env() {
        let saved: Vec<(&str, Option<String>)> = [
            "WIREBASE_LOG_LEVEL",
            "WIREBASE_LOG_FORMAT",
            "WIREBASE_LOG_FILE",
            "WIREBASE_LOG_SOURCE",
            "WIREBASE_LOG_SPANS",
            "RUST_LOG",
        ]
        .into_iter()
        .map(|key| (key, env::var(key).ok()))
        .collect();

        env::set_var("WIREBASE_LOG_LEVEL", "debug");
        env::set_var("WIREBASE_LOG_FORMAT", "json");
        env::set_var("WIREBASE_LOG_FILE", "/tmp/wirebase.log");
        env::set_var("WIREBASE_LOG_SOURCE", "true");
        env::set_var("WIREBASE_LOG_SPANS", "1");

        let config = LogConfig::from_env();
        assert!(matches!(config.level, LogLevel::Debug));
        assert!(matches!(config.format, LogFormat::Json));
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/wirebase.log")));
        assert!(config.source_location);
        assert!(config.span_events);

        env::remove_var("WIREBASE_LOG_LEVEL");
        env::set_var("RUST_LOG", "warn");
        let config = LogConfig::from_env();
        assert!(matches!(config.level, LogLevel::Warn));

        for (key, value) in saved {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}
