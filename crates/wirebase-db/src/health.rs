//! Database health monitoring.

use crate::client::DatabaseClient;
use crate::config::MonitoringConfig;
use crate::leak::LeakDetector;
use crate::monitor::{PoolMonitor, PoolStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use wirebase_common_log::spans::{db_span, Timer};

/// Health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unreachable,
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub state: HealthState,
    pub last_checked_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub details: Option<String>,
    pub pool: PoolStatus,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

/// Health checker settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Hard bound on the round-trip.
    pub timeout: Duration,
    /// Successful round-trips slower than this report degraded.
    pub degraded_latency: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from(&MonitoringConfig::default())
    }
}

impl From<&MonitoringConfig> for HealthConfig {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            timeout: config.health_check_timeout(),
            degraded_latency: config.degraded_latency(),
        }
    }
}

/// Outcome of one maintenance action.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceAction {
    pub name: &'static str,
    pub success: bool,
    pub detail: String,
    pub duration_ms: u64,
}

/// Summary of a maintenance pass.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub started_at: DateTime<Utc>,
    pub actions: Vec<MaintenanceAction>,
}

impl MaintenanceReport {
    pub fn all_succeeded(&self) -> bool {
        self.actions.iter().all(|a| a.success)
    }

    pub fn action(&self, name: &str) -> Option<&MaintenanceAction> {
        self.actions.iter().find(|a| a.name == name)
    }
}

/// Classifies the database by round-trip latency and runs housekeeping.
pub struct HealthChecker {
    client: Arc<dyn DatabaseClient>,
    monitor: Arc<PoolMonitor>,
    leaks: Option<Arc<LeakDetector>>,
    config: HealthConfig,
    last: RwLock<Option<HealthStatus>>,
    checks: AtomicU64,
}

impl HealthChecker {
    pub fn new(
        client: Arc<dyn DatabaseClient>,
        monitor: Arc<PoolMonitor>,
        config: HealthConfig,
    ) -> Self {
        Self {
            client,
            monitor,
            leaks: None,
            config,
            last: RwLock::new(None),
            checks: AtomicU64::new(0),
        }
    }

    /// Prune this detector's history during maintenance.
    pub fn with_leak_detector(mut self, leaks: Arc<LeakDetector>) -> Self {
        self.leaks = Some(leaks);
        self
    }

    /// Run a bounded round-trip and record the result.
    pub async fn check_health(&self) -> HealthStatus {
        let start = Instant::now();
        let result = tokio::time::timeout(self.config.timeout, self.client.ping())
            .instrument(db_span("check_health"))
            .await;

        let latency = start.elapsed();
        let latency_ms = latency.as_millis() as u64;
        let pool = self.monitor.pool_status(self.client.as_ref());

        let (state, details) = match result {
            Ok(Ok(())) if latency > self.config.degraded_latency => {
                warn!(latency_ms, "Database responding slowly");
                (
                    HealthState::Degraded,
                    Some(format!(
                        "Latency {}ms exceeds {}ms",
                        latency_ms,
                        self.config.degraded_latency.as_millis()
                    )),
                )
            }
            Ok(Ok(())) => {
                debug!(latency_ms, "Database health check passed");
                (HealthState::Healthy, None)
            }
            Ok(Err(e)) => {
                error!(error = %e, "Database health check failed");
                (HealthState::Unreachable, Some(e.to_string()))
            }
            Err(_) => {
                error!(
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Database health check timed out"
                );
                (HealthState::Unreachable, Some("Connection timeout".to_string()))
            }
        };

        let status = HealthStatus {
            state,
            last_checked_at: Utc::now(),
            latency_ms,
            details,
            pool,
        };

        self.checks.fetch_add(1, Ordering::Relaxed);
        *self.last.write() = Some(status.clone());
        status
    }

    /// Last computed status, running a check if there is none yet.
    pub async fn health_status(&self) -> HealthStatus {
        let cached = self.last.read().clone();
        match cached {
            Some(status) => status,
            None => self.check_health().await,
        }
    }

    /// Last computed status without running a check.
    pub fn last_status(&self) -> Option<HealthStatus> {
        self.last.read().clone()
    }

    /// Number of health checks run so far.
    pub fn checks_run(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    /// Run every housekeeping action; a failure is recorded on its action only.
    pub async fn perform_maintenance(&self) -> MaintenanceReport {
        let started_at = Utc::now();
        info!("Starting database maintenance");

        let mut actions = Vec::with_capacity(4);

        let timer = Timer::start("clear_idle_connections");
        let outcome = self
            .client
            .clear_idle_connections()
            .await
            .map(|closed| format!("Closed {} idle connections", closed));
        actions.push(action("clear_idle_connections", outcome, timer));

        let timer = Timer::start("analyze_statistics");
        let outcome = self
            .client
            .analyze()
            .await
            .map(|()| "Planner statistics refreshed".to_string());
        actions.push(action("analyze_statistics", outcome, timer));

        if let Some(leaks) = &self.leaks {
            let timer = Timer::start("prune_connection_history");
            let evicted = leaks.prune();
            actions.push(action(
                "prune_connection_history",
                Ok::<_, String>(format!("Evicted {} connection records", evicted)),
                timer,
            ));
        }

        let timer = Timer::start("verify_connectivity");
        let status = self.check_health().await;
        let outcome = match status.state {
            HealthState::Unreachable => Err(status
                .details
                .unwrap_or_else(|| "Database unreachable".to_string())),
            state => Ok(format!("Database {:?} in {}ms", state, status.latency_ms)),
        };
        actions.push(action("verify_connectivity", outcome, timer));

        let report = MaintenanceReport { started_at, actions };
        info!(
            succeeded = report.actions.iter().filter(|a| a.success).count(),
            total = report.actions.len(),
            "Database maintenance finished"
        );
        report
    }
}

fn action<E: std::fmt::Display>(
    name: &'static str,
    outcome: Result<String, E>,
    timer: Timer,
) -> MaintenanceAction {
    let duration_ms = timer.finish().as_millis() as u64;
    match outcome {
        Ok(detail) => MaintenanceAction {
            name,
            success: true,
            detail,
            duration_ms,
        },
        Err(e) => {
            warn!(action = name, error = %e, "Maintenance action failed");
            MaintenanceAction {
                name,
                success: false,
                detail: e.to_string(),
                duration_ms,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MockClient;

    fn checker(client: Arc<MockClient>) -> HealthChecker {
        HealthChecker::new(
            client,
            Arc::new(PoolMonitor::new()),
            HealthConfig {
                timeout: Duration::from_millis(5_000),
                degraded_latency: Duration::from_millis(1_000),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_ping_is_healthy() {
        let client = Arc::new(MockClient::new());
        client.set_ping_latency(Duration::from_millis(20));

        let status = checker(client).check_health().await;
        assert_eq!(status.state, HealthState::Healthy);
        assert!(status.details.is_none());
        assert!(status.pool.available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_ping_is_degraded() {
        let client = Arc::new(MockClient::new());
        client.set_ping_latency(Duration::from_millis(1_500));

        let status = checker(client).check_health().await;
        assert_eq!(status.state, HealthState::Degraded);
        assert!(status.latency_ms >= 1_500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ping_is_unreachable() {
        let client = Arc::new(MockClient::new());
        client.fail_ping("connection refused");

        let status = checker(client).check_health().await;
        assert_eq!(status.state, HealthState::Unreachable);
        assert!(status.details.unwrap().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_unreachable() {
        let client = Arc::new(MockClient::new());
        client.set_ping_latency(Duration::from_secs(60));

        let status = checker(client).check_health().await;
        assert_eq!(status.state, HealthState::Unreachable);
        assert_eq!(status.details.as_deref(), Some("Connection timeout"));
        assert!(status.latency_ms >= 5_000 && status.latency_ms < 6_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_status_is_cached() {
        let client = Arc::new(MockClient::new());
        let checker = checker(client.clone());

        assert!(checker.last_status().is_none());
        checker.health_status().await;
        checker.health_status().await;

        assert_eq!(checker.checks_run(), 1);
        assert_eq!(client.ping_count(), 1);

        checker.check_health().await;
        assert_eq!(client.ping_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_captures_failures_per_action() {
        let client = Arc::new(MockClient::new());
        client.fail_analyze("permission denied");
        let leaks = Arc::new(LeakDetector::default());
        let checker = checker(client).with_leak_detector(leaks);

        let report = checker.perform_maintenance().await;

        assert_eq!(report.actions.len(), 4);
        assert!(!report.all_succeeded());
        assert!(report.action("clear_idle_connections").unwrap().success);
        let analyze = report.action("analyze_statistics").unwrap();
        assert!(!analyze.success);
        assert!(analyze.detail.contains("permission denied"));
        assert!(report.action("prune_connection_history").unwrap().success);
        assert!(report.action("verify_connectivity").unwrap().success);
    }
}
