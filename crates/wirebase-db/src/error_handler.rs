//! Database error classification and statistics.
//!
//! Errors are bucketed by ordered substring matching on their code and
//! message. The order is part of the contract: a message mentioning both a
//! timeout and a connection is a timeout, because dashboards are built on
//! these buckets.

use crate::client::DatabaseClient;
use crate::error::ErrorSignature;
use crate::health::HealthChecker;
use crate::monitor::{PoolMonitor, PoolStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

const TIMEOUT_CODES: &[&str] = &["57014", "ETIMEDOUT", "QUERY_TIMEOUT", "POOL_TIMEOUT"];
const TIMEOUT_MESSAGES: &[&str] = &["timeout", "timed out"];

const CONNECTION_CODES: &[&str] = &[
    "ECONNREFUSED",
    "ECONNRESET",
    "ECONNABORTED",
    "ENOTCONN",
    "EPIPE",
    "POOL_CLOSED",
    "CONNECTION_RELEASED",
    "CONNECTION_BUSY",
    "57P01",
    "57P02",
    "57P03",
    "53300",
];
const CONNECTION_CODE_CLASSES: &[&str] = &["08"];
const CONNECTION_MESSAGES: &[&str] = &["connection", "connect", "socket", "too many clients"];

const TRANSACTION_CODES: &[&str] = &["40001", "40P01"];
const TRANSACTION_CODE_CLASSES: &[&str] = &["25", "40"];
const TRANSACTION_MESSAGES: &[&str] = &["transaction", "deadlock", "could not serialize"];

const QUERY_CODE_CLASSES: &[&str] = &["22", "23", "42"];
const QUERY_MESSAGES: &[&str] = &["syntax", "relation", "column", "violates", "query"];

/// Errors that mean the database itself is failing, as opposed to a bad query.
const FAILURE_CODES: &[&str] = &[
    "ECONNREFUSED",
    "ECONNRESET",
    "ETIMEDOUT",
    "POOL_TIMEOUT",
    "POOL_CLOSED",
    "57P01",
    "57P03",
    "53300",
    "08000",
    "08001",
    "08003",
    "08006",
];
const FAILURE_MESSAGES: &[&str] = &[
    "connection refused",
    "connection terminated",
    "connection reset",
    "pool timed out",
    "too many clients",
    "the database system is starting up",
    "the database system is shutting down",
];

/// Error bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Timeout,
    Connection,
    Transaction,
    Query,
    Other,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Transaction => "transaction",
            Self::Query => "query",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

fn code_matches(code: Option<&str>, codes: &[&str], classes: &[&str]) -> bool {
    code.is_some_and(|c| codes.contains(&c) || classes.iter().any(|class| c.starts_with(class)))
}

fn message_matches(message: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| message.contains(n))
}

/// Bucket an error: timeout, then connection, then transaction, then query.
pub fn classify(code: Option<&str>, message: &str) -> ErrorCategory {
    let message = message.to_lowercase();

    if code_matches(code, TIMEOUT_CODES, &[]) || message_matches(&message, TIMEOUT_MESSAGES) {
        ErrorCategory::Timeout
    } else if code_matches(code, CONNECTION_CODES, CONNECTION_CODE_CLASSES)
        || message_matches(&message, CONNECTION_MESSAGES)
    {
        ErrorCategory::Connection
    } else if code_matches(code, TRANSACTION_CODES, TRANSACTION_CODE_CLASSES)
        || message_matches(&message, TRANSACTION_MESSAGES)
    {
        ErrorCategory::Transaction
    } else if code_matches(code, &[], QUERY_CODE_CLASSES) || message_matches(&message, QUERY_MESSAGES) {
        ErrorCategory::Query
    } else {
        ErrorCategory::Other
    }
}

/// Whether an error signals a failing database rather than a failing query.
pub fn is_database_failure<E: ErrorSignature + ?Sized>(err: &E) -> bool {
    let code = err.code();
    if code.as_deref().is_some_and(|c| FAILURE_CODES.contains(&c)) {
        return true;
    }

    let message = err.message().to_lowercase();
    message_matches(&message, FAILURE_MESSAGES)
}

/// Snapshot of error counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub connection_errors: u64,
    pub query_errors: u64,
    pub timeout_errors: u64,
    pub transaction_errors: u64,
    pub other_errors: u64,
    pub errors_by_code: BTreeMap<String, u64>,
    pub last_error: Option<String>,
    pub last_error_context: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

impl ErrorStats {
    fn count(&mut self, category: ErrorCategory) -> u64 {
        self.total_errors += 1;
        let counter = match category {
            ErrorCategory::Timeout => &mut self.timeout_errors,
            ErrorCategory::Connection => &mut self.connection_errors,
            ErrorCategory::Transaction => &mut self.transaction_errors,
            ErrorCategory::Query => &mut self.query_errors,
            ErrorCategory::Other => &mut self.other_errors,
        };
        *counter += 1;
        *counter
    }
}

/// Error statistics together with the pool at the time of reading.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    #[serde(flatten)]
    pub stats: ErrorStats,
    pub pool: PoolStatus,
}

/// An error that went through [`ErrorHandler::handle_error`].
///
/// Displays as the original error, which stays available as the source.
#[derive(Debug)]
pub struct ObservedError<E> {
    error: E,
    category: ErrorCategory,
    context: String,
    pool: PoolStatus,
}

impl<E> ObservedError<E> {
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn pool(&self) -> &PoolStatus {
        &self.pool
    }

    pub fn inner(&self) -> &E {
        &self.error
    }

    pub fn into_inner(self) -> E {
        self.error
    }
}

impl<E: fmt::Display> fmt::Display for ObservedError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl<E> std::error::Error for ObservedError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Counts database errors and escalates repeated connection failures to a health check.
pub struct ErrorHandler {
    stats: Mutex<ErrorStats>,
    client: Arc<dyn DatabaseClient>,
    monitor: Arc<PoolMonitor>,
    health: Option<Arc<HealthChecker>>,
    escalation_every: u64,
    escalations: AtomicU64,
}

impl ErrorHandler {
    pub fn new(client: Arc<dyn DatabaseClient>, monitor: Arc<PoolMonitor>) -> Self {
        Self {
            stats: Mutex::new(ErrorStats::default()),
            client,
            monitor,
            health: None,
            escalation_every: 5,
            escalations: AtomicU64::new(0),
        }
    }

    /// Dispatch a health check on this checker every `every` connection errors.
    pub fn with_escalation(mut self, health: Arc<HealthChecker>, every: u64) -> Self {
        self.health = Some(health);
        self.escalation_every = every.max(1);
        self
    }

    /// Classify and count an error, returning it annotated.
    pub fn handle_error<E>(&self, error: E, context: impl Into<String>) -> ObservedError<E>
    where
        E: ErrorSignature,
    {
        let context = context.into();
        let code = error.code();
        let message = error.message();
        let category = classify(code.as_deref(), &message);

        let category_count = {
            let mut stats = self.stats.lock();
            let count = stats.count(category);
            *stats
                .errors_by_code
                .entry(code.clone().unwrap_or_else(|| "UNKNOWN".to_string()))
                .or_insert(0) += 1;
            stats.last_error = Some(message.clone());
            stats.last_error_context = Some(context.clone());
            stats.last_error_time = Some(Utc::now());
            count
        };

        error!(
            category = %category,
            code = code.as_deref().unwrap_or("UNKNOWN"),
            context = %context,
            error = %message,
            "Database error"
        );

        if category == ErrorCategory::Connection && category_count % self.escalation_every == 0 {
            self.escalate(category_count);
        }

        ObservedError {
            pool: self.monitor.pool_status(self.client.as_ref()),
            error,
            category,
            context,
        }
    }

    /// Current counters.
    pub fn stats(&self) -> ErrorStats {
        self.stats.lock().clone()
    }

    /// Current counters with a live pool snapshot.
    pub fn error_stats(&self) -> ErrorReport {
        ErrorReport {
            stats: self.stats(),
            pool: self.monitor.pool_status(self.client.as_ref()),
        }
    }

    /// Zero all counters. Health status and connection history are untouched.
    pub fn reset_error_stats(&self) {
        *self.stats.lock() = ErrorStats::default();
        debug!("Error statistics reset");
    }

    /// Health checks dispatched by escalation so far.
    pub fn escalations(&self) -> u64 {
        self.escalations.load(Ordering::Relaxed)
    }

    fn escalate(&self, connection_errors: u64) {
        let Some(health) = self.health.clone() else {
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available; skipping escalated health check");
            return;
        };

        self.escalations.fetch_add(1, Ordering::Relaxed);
        warn!(connection_errors, "Repeated connection errors; dispatching health check");

        // Dispatched, never awaited: error handling latency must not depend on it.
        runtime.spawn(async move {
            let status = health.check_health().await;
            debug!(state = ?status.state, "Escalated health check finished");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::health::HealthConfig;
    use crate::testkit::{MockClient, TestError};
    use std::time::Duration;

    fn handler(client: Arc<MockClient>) -> ErrorHandler {
        ErrorHandler::new(client, Arc::new(PoolMonitor::new()))
    }

    #[test]
    fn test_classification_priority() {
        assert_eq!(classify(None, "Connection timeout"), ErrorCategory::Timeout);
        assert_eq!(classify(Some("57014"), "canceling statement"), ErrorCategory::Timeout);
        assert_eq!(classify(Some("ECONNREFUSED"), "refused"), ErrorCategory::Connection);
        assert_eq!(classify(Some("08006"), "failure"), ErrorCategory::Connection);
        assert_eq!(classify(None, "transaction aborted"), ErrorCategory::Transaction);
        assert_eq!(classify(Some("40P01"), "deadlock detected"), ErrorCategory::Transaction);
        assert_eq!(classify(Some("42601"), "syntax error at or near"), ErrorCategory::Query);
        assert_eq!(classify(Some("23505"), "duplicate key value"), ErrorCategory::Query);
        assert_eq!(classify(None, "something else"), ErrorCategory::Other);
    }

    #[test]
    fn test_overlapping_terms_follow_priority() {
        // Timeout wins over connection, connection over transaction.
        assert_eq!(
            classify(None, "timeout while opening connection"),
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify(None, "connection lost during transaction"),
            ErrorCategory::Connection
        );
        assert_eq!(
            classify(None, "transaction failed: column missing"),
            ErrorCategory::Transaction
        );
    }

    #[test]
    fn test_exactly_one_counter_per_error() {
        let handler = handler(Arc::new(MockClient::new()));
        let errors = [
            TestError::new(Some("57014"), "statement timeout"),
            TestError::new(Some("08006"), "connection failure"),
            TestError::new(Some("40001"), "could not serialize access"),
            TestError::new(Some("42P01"), "relation does not exist"),
            TestError::new(None, "boom"),
        ];

        for (i, err) in errors.into_iter().enumerate() {
            let before = handler.stats();
            handler.handle_error(err, "GET /api/users");
            let after = handler.stats();

            let deltas = [
                after.timeout_errors - before.timeout_errors,
                after.connection_errors - before.connection_errors,
                after.transaction_errors - before.transaction_errors,
                after.query_errors - before.query_errors,
                after.other_errors - before.other_errors,
            ];
            assert_eq!(deltas.iter().sum::<u64>(), 1);
            assert_eq!(deltas[i], 1);
            assert_eq!(after.total_errors, before.total_errors + 1);
        }

        let stats = handler.stats();
        assert_eq!(stats.errors_by_code.get("57014"), Some(&1));
        assert_eq!(stats.errors_by_code.get("UNKNOWN"), Some(&1));
        assert_eq!(stats.last_error.as_deref(), Some("boom"));
        assert_eq!(stats.last_error_context.as_deref(), Some("GET /api/users"));
        assert!(stats.last_error_time.is_some());
    }

    #[test]
    fn test_handle_error_returns_original() {
        let client = Arc::new(MockClient::new());
        let handler = handler(client);

        let observed = handler.handle_error(DbError::Timeout { timeout_ms: 50 }, "POST /db/maintenance");

        assert_eq!(observed.to_string(), "Query timeout after 50ms");
        assert_eq!(observed.category(), ErrorCategory::Timeout);
        assert_eq!(observed.context(), "POST /db/maintenance");
        assert!(observed.pool().available);
        assert!(std::error::Error::source(&observed).is_some());
        assert!(matches!(observed.into_inner(), DbError::Timeout { timeout_ms: 50 }));
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let handler = handler(Arc::new(MockClient::new()));
        for _ in 0..3 {
            handler.handle_error(TestError::new(Some("ECONNREFUSED"), "refused"), "ctx");
        }

        handler.reset_error_stats();

        let stats = handler.stats();
        assert_eq!(stats.total_errors, 0);
        assert_eq!(stats.connection_errors, 0);
        assert!(stats.errors_by_code.is_empty());
        assert!(stats.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalates_on_every_fifth_connection_error() {
        let client = Arc::new(MockClient::new());
        let monitor = Arc::new(PoolMonitor::new());
        let health = Arc::new(HealthChecker::new(
            client.clone(),
            monitor.clone(),
            HealthConfig::default(),
        ));
        let handler = ErrorHandler::new(client.clone(), monitor).with_escalation(health.clone(), 5);

        for n in 1..=9 {
            handler.handle_error(TestError::new(Some("ECONNREFUSED"), "connection refused"), "ctx");
            let expected = if n >= 5 { 1 } else { 0 };
            assert_eq!(handler.escalations(), expected, "after error {n}");
        }

        // Non-connection errors never escalate.
        for _ in 0..5 {
            handler.handle_error(TestError::new(Some("42601"), "syntax error"), "ctx");
        }
        assert_eq!(handler.escalations(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.ping_count(), 1);
        assert!(health.last_status().is_some());

        handler.handle_error(TestError::new(Some("ECONNREFUSED"), "connection refused"), "ctx");
        assert_eq!(handler.escalations(), 2);
    }

    #[test]
    fn test_database_failure_signatures() {
        assert!(is_database_failure(&TestError::new(Some("ECONNREFUSED"), "x")));
        assert!(is_database_failure(&TestError::new(Some("57P01"), "terminating")));
        assert!(is_database_failure(&TestError::new(None, "Connection terminated unexpectedly")));
        assert!(is_database_failure(&DbError::from(sqlx::Error::PoolTimedOut)));
        assert!(!is_database_failure(&TestError::new(Some("23505"), "duplicate key")));
        assert!(!is_database_failure(&TestError::new(None, "relation does not exist")));
    }
}
