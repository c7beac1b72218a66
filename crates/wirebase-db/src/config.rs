//! Database configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Database connection URL.
    #[serde(default)]
    pub url: String,
    /// Maximum connections in pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum connections in pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection acquire timeout.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    /// Connection idle timeout.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Maximum connection lifetime.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: u64,
    /// Statement cache size.
    #[serde(default = "default_statement_cache")]
    pub statement_cache_size: usize,
    /// Enable query logging.
    #[serde(default)]
    pub log_queries: bool,
    /// Slow query threshold (ms).
    #[serde(default = "default_slow_query")]
    pub slow_query_threshold_ms: u64,
    /// Default bound for `execute_query` (ms).
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,
    /// Monitoring settings.
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Settings for the pool monitor, leak detector, health checker and error handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Hard bound on the health round-trip (ms).
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_ms: u64,
    /// Latency above which a successful health check reports degraded (ms).
    #[serde(default = "default_degraded_latency")]
    pub degraded_latency_ms: u64,
    /// Age at which an unreleased connection becomes a leak candidate (ms).
    #[serde(default = "default_leak_threshold")]
    pub leak_threshold_ms: u64,
    /// Age a candidate must reach before a non-forced fix releases it (ms).
    #[serde(default = "default_strict_leak_threshold")]
    pub strict_leak_threshold_ms: u64,
    /// Maximum number of connection records kept.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Age after which released records are evicted (seconds).
    #[serde(default = "default_history_retention")]
    pub history_retention_secs: u64,
    /// Interval of the background pool sampler and leak watch (seconds).
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
    /// A health check is dispatched every time connection errors reach a multiple of this.
    #[serde(default = "default_escalation_every")]
    pub escalation_every: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_lifetime() -> u64 {
    3600
}

fn default_statement_cache() -> usize {
    100
}

fn default_slow_query() -> u64 {
    1000
}

fn default_query_timeout() -> u64 {
    30_000
}

fn default_health_timeout() -> u64 {
    5_000
}

fn default_degraded_latency() -> u64 {
    1_000
}

fn default_leak_threshold() -> u64 {
    30_000
}

fn default_strict_leak_threshold() -> u64 {
    300_000 // 5 minutes
}

fn default_history_capacity() -> usize {
    100
}

fn default_history_retention() -> u64 {
    3600
}

fn default_sample_interval() -> u64 {
    30
}

fn default_escalation_every() -> u64 {
    5
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            max_lifetime_secs: default_max_lifetime(),
            statement_cache_size: default_statement_cache(),
            log_queries: false,
            slow_query_threshold_ms: default_slow_query(),
            query_timeout_ms: default_query_timeout(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_timeout_ms: default_health_timeout(),
            degraded_latency_ms: default_degraded_latency(),
            leak_threshold_ms: default_leak_threshold(),
            strict_leak_threshold_ms: default_strict_leak_threshold(),
            history_capacity: default_history_capacity(),
            history_retention_secs: default_history_retention(),
            sample_interval_secs: default_sample_interval(),
            escalation_every: default_escalation_every(),
        }
    }
}

impl DbConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl MonitoringConfig {
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn degraded_latency(&self) -> Duration {
        Duration::from_millis(self.degraded_latency_ms)
    }

    pub fn leak_threshold(&self) -> Duration {
        Duration::from_millis(self.leak_threshold_ms)
    }

    pub fn strict_leak_threshold(&self) -> Duration {
        Duration::from_millis(self.strict_leak_threshold_ms)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs)
    }

    /// Period of the pool sampler and leak watch; never shorter than one second.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.query_timeout(), Duration::from_secs(30));
        assert_eq!(config.monitoring.health_check_timeout(), Duration::from_secs(5));
        assert_eq!(config.monitoring.leak_threshold(), Duration::from_secs(30));
        assert_eq!(config.monitoring.strict_leak_threshold(), Duration::from_secs(300));
        assert_eq!(config.monitoring.escalation_every, 5);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DbConfig = serde_json::from_str(
            r#"{"url": "postgres://localhost/wirebase", "monitoring": {"leak_threshold_ms": 10000}}"#,
        )
        .unwrap();

        assert_eq!(config.url, "postgres://localhost/wirebase");
        assert_eq!(config.monitoring.leak_threshold_ms, 10_000);
        assert_eq!(config.monitoring.history_capacity, 100);
        assert_eq!(config.slow_query_threshold_ms, 1000);
    }

    #[test]
    fn test_sample_interval_never_zero() {
        let config = MonitoringConfig {
            sample_interval_secs: 0,
            ..MonitoringConfig::default()
        };
        assert_eq!(config.sample_interval(), Duration::from_secs(1));
    }
}
