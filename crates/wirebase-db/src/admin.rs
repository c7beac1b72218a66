//! Admin reporting surface.
//!
//! [`DbAdmin`] owns one instance of each monitoring component and wires them
//! together: the health checker prunes the leak detector's history, and the
//! error handler escalates to the health checker. Tests build a fresh one per
//! case; the server builds one at startup and shares it.

use crate::client::DatabaseClient;
use crate::config::MonitoringConfig;
use crate::error_handler::{ErrorHandler, ErrorReport};
use crate::health::{HealthChecker, HealthConfig, HealthStatus, MaintenanceReport};
use crate::leak::{FixReport, LeakConfig, LeakDetector, LeakReport};
use crate::monitor::{PoolMetrics, PoolMonitor, PoolStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

/// Combined snapshot served by `GET /db/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub pool: PoolStatus,
    pub pool_metrics: PoolMetrics,
    pub health: HealthStatus,
    pub errors: ErrorReport,
    pub leaks: LeakReport,
    pub history_size: usize,
    pub generated_at: DateTime<Utc>,
}

/// Read and action interface over the database monitoring components.
pub struct DbAdmin {
    client: Arc<dyn DatabaseClient>,
    monitor: Arc<PoolMonitor>,
    leaks: Arc<LeakDetector>,
    health: Arc<HealthChecker>,
    errors: Arc<ErrorHandler>,
    config: MonitoringConfig,
}

impl DbAdmin {
    /// Build the components around `client`.
    ///
    /// `leaks` must be the detector the client reports checkouts to.
    pub fn new(
        client: Arc<dyn DatabaseClient>,
        leaks: Arc<LeakDetector>,
        config: MonitoringConfig,
    ) -> Self {
        let monitor = Arc::new(PoolMonitor::new());
        let health = Arc::new(
            HealthChecker::new(client.clone(), monitor.clone(), HealthConfig::from(&config))
                .with_leak_detector(leaks.clone()),
        );
        let errors = Arc::new(
            ErrorHandler::new(client.clone(), monitor.clone())
                .with_escalation(health.clone(), config.escalation_every),
        );

        Self {
            client,
            monitor,
            leaks,
            health,
            errors,
            config,
        }
    }

    /// Components with a detector of their own, for clients that do not track checkouts.
    pub fn standalone(client: Arc<dyn DatabaseClient>, config: MonitoringConfig) -> Self {
        let leaks = Arc::new(LeakDetector::new(LeakConfig::from(&config)));
        Self::new(client, leaks, config)
    }

    pub fn client(&self) -> &Arc<dyn DatabaseClient> {
        &self.client
    }

    pub fn monitor(&self) -> &Arc<PoolMonitor> {
        &self.monitor
    }

    pub fn leak_detector(&self) -> &Arc<LeakDetector> {
        &self.leaks
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub async fn status_report(&self) -> StatusReport {
        let health = self.health.health_status().await;

        StatusReport {
            pool: self.monitor.pool_status(self.client.as_ref()),
            pool_metrics: self.monitor.metrics(),
            health,
            errors: self.errors.error_stats(),
            leaks: self.leaks.check_for_leaks(),
            history_size: self.leaks.history_len(),
            generated_at: Utc::now(),
        }
    }

    pub async fn health_check(&self) -> HealthStatus {
        self.health.check_health().await
    }

    pub async fn maintenance(&self) -> MaintenanceReport {
        self.health.perform_maintenance().await
    }

    pub fn leaks(&self) -> LeakReport {
        self.leaks.check_for_leaks()
    }

    pub async fn fix_leaks(&self, force: bool) -> FixReport {
        self.leaks.fix_leaks(self.client.as_ref(), force).await
    }

    pub fn reset_errors(&self) {
        self.errors.reset_error_stats();
    }

    pub fn reset_metrics(&self) {
        self.monitor.reset_metrics();
    }

    /// Start the pool sampler and the leak watch; both stop on `shutdown`.
    pub fn spawn_background(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let interval = self.config.sample_interval();
        info!(interval_secs = interval.as_secs(), "Starting database monitors");

        vec![
            self.monitor
                .clone()
                .spawn_sampler(self.client.clone(), interval, shutdown.subscribe()),
            self.leaks.clone().spawn_watch(interval, shutdown.subscribe()),
        ]
    }
}
