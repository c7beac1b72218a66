//! Configuration validation.

use super::types::ServerConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid database URL")]
    InvalidDatabaseUrl,

    #[error("Invalid port: {0}")]
    InvalidPort(u16),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Invalid pool size: min_connections {min} exceeds max_connections {max}")]
    InvalidPoolSize { min: u32, max: u32 },

    #[error("Leak threshold {leak_ms}ms exceeds strict leak threshold {strict_ms}ms")]
    InvalidLeakThresholds { leak_ms: u64, strict_ms: u64 },

    #[error("Connection history capacity must be greater than zero")]
    ZeroHistoryCapacity,

    #[error("Health check escalation interval must be greater than zero")]
    ZeroEscalationInterval,

    #[error("Pool sample interval must be greater than zero")]
    ZeroSampleInterval,
}

/// Validate server configuration, reporting every violation.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let database = &config.database;
    let monitoring = &database.monitoring;

    if database.url.is_empty() {
        errors.push(ConfigError::InvalidDatabaseUrl);
    }

    if config.server.port == 0 {
        errors.push(ConfigError::InvalidPort(0));
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.to_lowercase().as_str()) {
        errors.push(ConfigError::InvalidLogLevel(config.logging.level.clone()));
    }

    if database.min_connections > database.max_connections {
        errors.push(ConfigError::InvalidPoolSize {
            min: database.min_connections,
            max: database.max_connections,
        });
    }

    if monitoring.leak_threshold_ms > monitoring.strict_leak_threshold_ms {
        errors.push(ConfigError::InvalidLeakThresholds {
            leak_ms: monitoring.leak_threshold_ms,
            strict_ms: monitoring.strict_leak_threshold_ms,
        });
    }

    if monitoring.history_capacity == 0 {
        errors.push(ConfigError::ZeroHistoryCapacity);
    }

    if monitoring.escalation_every == 0 {
        errors.push(ConfigError::ZeroEscalationInterval);
    }

    if monitoring.sample_interval_secs == 0 {
        errors.push(ConfigError::ZeroSampleInterval);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
