//! Connection leak detection.
//!
//! Every checkout is appended to a bounded history, most recent first. A
//! record whose connection is still out after the leak threshold is a leak
//! candidate; candidates are derived on each query, never stored.
//!
//! History is bounded two ways:
//! - released records older than the retention window are evicted
//! - past capacity, the oldest released record goes first, then the oldest overall
//!
//! Records are never mutated once their release time is set.

use crate::client::DatabaseClient;
use crate::config::MonitoringConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use wirebase_common_log::spans::db_span;

/// Leak detector settings.
#[derive(Debug, Clone)]
pub struct LeakConfig {
    /// Age at which an unreleased connection is a leak candidate.
    pub leak_threshold: Duration,
    /// Age a candidate must reach before a non-forced fix releases it.
    pub strict_threshold: Duration,
    /// Maximum records kept.
    pub capacity: usize,
    /// Age after which released records are evicted.
    pub retention: Duration,
}

impl Default for LeakConfig {
    fn default() -> Self {
        Self::from(&MonitoringConfig::default())
    }
}

impl From<&MonitoringConfig> for LeakConfig {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            leak_threshold: config.leak_threshold(),
            strict_threshold: config.strict_leak_threshold(),
            capacity: config.history_capacity,
            retention: config.history_retention(),
        }
    }
}

/// One checkout of a pooled connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub acquired_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    acquired: Instant,
    #[serde(skip)]
    released: Option<Instant>,
}

impl ConnectionRecord {
    fn new(id: &str, now: Instant) -> Self {
        Self {
            id: id.to_string(),
            acquired_at: Utc::now(),
            released_at: None,
            acquired: now,
            released: None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.is_some()
    }

    /// How long the connection was (or has been) held.
    pub fn held_for(&self, now: Instant) -> Duration {
        self.released.unwrap_or(now).saturating_duration_since(self.acquired)
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.acquired)
    }

    fn release(&mut self, now: Instant) {
        self.released = Some(now);
        // Derived from the monotonic clock so it can never precede acquired_at.
        let held = chrono::Duration::from_std(now.saturating_duration_since(self.acquired))
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.released_at = Some(self.acquired_at + held);
    }
}

/// A connection held past the leak threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakCandidate {
    pub id: String,
    pub acquired_at: DateTime<Utc>,
    pub held_ms: u64,
}

/// Result of [`LeakDetector::check_for_leaks`].
#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    pub count: usize,
    pub candidates: Vec<LeakCandidate>,
}

/// Result of [`LeakDetector::fix_leaks`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FixReport {
    pub released: u32,
    pub failed: u32,
}

/// Outcome of [`LeakDetector::record_release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    AlreadyReleased,
    Unknown,
}

/// Tracks connection checkouts and flags the ones never returned.
pub struct LeakDetector {
    config: LeakConfig,
    history: Mutex<VecDeque<ConnectionRecord>>,
    releasing: Mutex<HashSet<String>>,
}

impl LeakDetector {
    pub fn new(config: LeakConfig) -> Self {
        Self {
            config,
            history: Mutex::new(VecDeque::new()),
            releasing: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &LeakConfig {
        &self.config
    }

    /// Record a checkout.
    pub fn record_acquire(&self, connection_id: &str) {
        let now = Instant::now();
        let mut history = self.history.lock();
        history.push_front(ConnectionRecord::new(connection_id, now));
        self.evict(&mut history, now);
    }

    /// Record a release on the most recent open record for `connection_id`.
    pub fn record_release(&self, connection_id: &str) -> ReleaseOutcome {
        let now = Instant::now();
        let mut history = self.history.lock();

        if let Some(record) = history
            .iter_mut()
            .find(|r| r.id == connection_id && !r.is_released())
        {
            record.release(now);
            return ReleaseOutcome::Released;
        }

        if history.iter().any(|r| r.id == connection_id) {
            ReleaseOutcome::AlreadyReleased
        } else {
            debug!(connection_id, "Release recorded for unknown connection");
            ReleaseOutcome::Unknown
        }
    }

    /// Connection records, most recent first.
    pub fn connection_history(&self) -> Vec<ConnectionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// Unreleased connections held longer than the leak threshold.
    pub fn potential_leaks(&self) -> Vec<LeakCandidate> {
        let now = Instant::now();
        self.history
            .lock()
            .iter()
            .filter(|r| !r.is_released() && r.held_for(now) > self.config.leak_threshold)
            .map(|r| LeakCandidate {
                id: r.id.clone(),
                acquired_at: r.acquired_at,
                held_ms: r.held_for(now).as_millis() as u64,
            })
            .collect()
    }

    pub fn check_for_leaks(&self) -> LeakReport {
        let candidates = self.potential_leaks();
        LeakReport {
            count: candidates.len(),
            candidates,
        }
    }

    /// Force-release leak candidates through the client.
    ///
    /// Without `force`, only candidates older than the strict threshold are
    /// touched. Failures are counted, not retried.
    pub async fn fix_leaks(&self, client: &dyn DatabaseClient, force: bool) -> FixReport {
        let strict_ms = self.config.strict_threshold.as_millis() as u64;
        let candidates: Vec<LeakCandidate> = self
            .potential_leaks()
            .into_iter()
            .filter(|c| force || c.held_ms > strict_ms)
            .collect();

        let mut report = FixReport::default();

        async {
            for candidate in candidates {
                let id = candidate.id;
                let Some(_claim) = self.claim(&id) else {
                    debug!(connection_id = %id, "Release already in flight");
                    continue;
                };

                // Released normally since the candidates were computed.
                if !self.is_outstanding(&id) {
                    continue;
                }

                match client.force_release(&id).await {
                    Ok(()) => {
                        self.record_release(&id);
                        report.released += 1;
                    }
                    Err(e) => {
                        warn!(connection_id = %id, error = %e, "Failed to release leaked connection");
                        report.failed += 1;
                    }
                }
            }
        }
        .instrument(db_span("fix_leaks"))
        .await;

        info!(
            released = report.released,
            failed = report.failed,
            force,
            "Leak fix pass finished"
        );
        report
    }

    /// Evict expired records. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut history = self.history.lock();
        let before = history.len();
        self.evict(&mut history, Instant::now());
        before - history.len()
    }

    /// Periodically log leak candidates and prune history until shutdown.
    pub fn spawn_watch(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.prune();
                        let report = self.check_for_leaks();
                        for candidate in &report.candidates {
                            warn!(
                                connection_id = %candidate.id,
                                held_ms = candidate.held_ms,
                                "Potential connection leak"
                            );
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Leak watch stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Mark a release of `connection_id` as in flight until the claim is dropped.
    fn claim(&self, connection_id: &str) -> Option<ReleaseClaim<'_>> {
        if !self.releasing.lock().insert(connection_id.to_string()) {
            return None;
        }
        Some(ReleaseClaim {
            releasing: &self.releasing,
            id: connection_id.to_string(),
        })
    }

    fn is_outstanding(&self, connection_id: &str) -> bool {
        self.history
            .lock()
            .iter()
            .any(|r| r.id == connection_id && !r.is_released())
    }

    fn evict(&self, history: &mut VecDeque<ConnectionRecord>, now: Instant) {
        let retention = self.config.retention;
        history.retain(|r| !(r.is_released() && r.age(now) > retention));

        while history.len() > self.config.capacity {
            let index = history
                .iter()
                .rposition(|r| r.is_released())
                .unwrap_or(history.len() - 1);

            if let Some(evicted) = history.remove(index) {
                if !evicted.is_released() {
                    warn!(connection_id = %evicted.id, "Evicted unreleased connection from history");
                }
            }
        }
    }
}

/// In-flight marker for one forced release; cleared on drop, including when
/// the fix pass is cancelled mid-release.
struct ReleaseClaim<'a> {
    releasing: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for ReleaseClaim<'_> {
    fn drop(&mut self) {
        self.releasing.lock().remove(&self.id);
    }
}

impl Default for LeakDetector {
    fn default() -> Self {
        Self::new(LeakConfig::default())
    }
}
