//! Query instrumentation for logging.

use crate::config::DbConfig;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default bound on how long a caller waits for a query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default latency above which a query is logged as slow.
pub const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(1_000);

/// Timeout and slow-query settings for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    pub timeout: Duration,
    pub slow_threshold: Duration,
    /// Log every completed query, not only slow ones.
    pub log_queries: bool,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_QUERY_TIMEOUT,
            slow_threshold: DEFAULT_SLOW_QUERY_THRESHOLD,
            log_queries: false,
        }
    }
}

impl From<&DbConfig> for QueryLimits {
    fn from(config: &DbConfig) -> Self {
        Self {
            timeout: config.query_timeout(),
            slow_threshold: config.slow_query_threshold(),
            log_queries: config.log_queries,
        }
    }
}

impl QueryLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Query execution timer.
pub struct QueryTimer {
    query: String,
    start: Instant,
    slow_threshold: Duration,
    log_all: bool,
}

impl QueryTimer {
    pub fn new(query: impl Into<String>, slow_threshold: Duration) -> Self {
        Self {
            query: query.into(),
            start: Instant::now(),
            slow_threshold,
            log_all: false,
        }
    }

    /// Timer configured from `limits`.
    pub fn with_limits(query: impl Into<String>, limits: &QueryLimits) -> Self {
        Self {
            log_all: limits.log_queries,
            ..Self::new(query, limits.slow_threshold)
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn is_slow(&self) -> bool {
        self.elapsed() > self.slow_threshold
    }

    pub fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        if elapsed > self.slow_threshold {
            warn!(
                query = %self.query,
                elapsed_ms,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                "Slow query detected"
            );
        } else if self.log_all {
            debug!(query = %self.query, elapsed_ms, "Query completed");
        }

        elapsed
    }
}
