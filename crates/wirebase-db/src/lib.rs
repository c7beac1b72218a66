//! Database connection management and monitoring for Wirebase.
//!
//! This crate provides:
//! - A PostgreSQL client that tracks every connection checkout
//! - Pool occupancy monitoring
//! - Leak detection and forced release of abandoned connections
//! - Health checks and maintenance
//! - Error classification with health-check escalation
//! - Transaction and timeout helpers

pub mod admin;
pub mod client;
pub mod config;
pub mod error;
pub mod error_handler;
pub mod health;
pub mod instrumentation;
pub mod leak;
pub mod monitor;
pub mod transaction;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use admin::{DbAdmin, StatusReport};
pub use client::{
    create_pool, DatabaseClient, PgClient, PgTransaction, PoolCounts, TrackedConnection,
    TransactionHandle, TransactionalClient,
};
pub use config::{DbConfig, MonitoringConfig};
pub use error::{DbError, DbResult, ErrorSignature};
pub use error_handler::{
    classify, is_database_failure, ErrorCategory, ErrorHandler, ErrorReport, ErrorStats,
    ObservedError,
};
pub use health::{HealthChecker, HealthConfig, HealthState, HealthStatus, MaintenanceReport};
pub use instrumentation::{QueryLimits, QueryTimer, DEFAULT_QUERY_TIMEOUT};
pub use leak::{ConnectionRecord, FixReport, LeakCandidate, LeakConfig, LeakDetector, LeakReport};
pub use monitor::{PoolMetrics, PoolMonitor, PoolStatus};
pub use transaction::{
    execute_query, with_retry, with_transaction, IsolationLevel, TransactionOptions,
};
