//! Server configuration types.

use serde::{Deserialize, Serialize};
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use wirebase_common_log::{LogConfig, LogFormat, LogLevel};
use wirebase_db::DbConfig;

/// Main server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server binding configuration.
    pub server: ServerBindConfig,
    /// Admin authentication.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Database and monitoring configuration.
    pub database: DbConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Server binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerBindConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Time allowed for in-flight requests after a shutdown signal.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl ServerBindConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Admin authentication configuration.
///
/// Sessions are owned by the surrounding application. A bearer token is
/// accepted as an admin credential when one is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Bearer token granting the admin role.
    #[serde(default)]
    pub admin_token: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (pretty, compact or json).
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Also append logs to this file.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl LoggingConfig {
    /// Logging settings, with `WIREBASE_LOG_*` variables taking precedence.
    pub fn to_log_config(&self) -> LogConfig {
        let mut config = LogConfig {
            level: LogLevel::parse(&self.level).unwrap_or_default(),
            format: LogFormat::parse(&self.format),
            file_path: self.file.clone(),
            ..LogConfig::default()
        };

        let env = LogConfig::from_env();
        if std::env::var("WIREBASE_LOG_LEVEL").is_ok() {
            config.level = env.level;
        }
        if std::env::var("WIREBASE_LOG_FORMAT").is_ok() {
            config.format = env.format;
        }
        if env.file_path.is_some() {
            config.file_path = env.file_path;
        }
        config.source_location = env.source_location;
        config.span_events = env.span_events;
        config
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}
