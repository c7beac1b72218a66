//! Connection pool occupancy monitoring.
//!
//! [`PoolMonitor::pool_status`] always reads live counters from the client.
//! The monitor itself only accumulates sampler metrics (peaks and sample
//! counts); clearing them never touches the pool.

use crate::client::{DatabaseClient, PoolCounts};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Pool occupancy at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    /// False when the client could not report its pool.
    pub available: bool,
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
    pub pending_acquires: u32,
    /// Active / total, 0 for an empty pool.
    pub utilization: f64,
    pub timestamp: DateTime<Utc>,
}

impl PoolStatus {
    fn from_counts(counts: PoolCounts) -> Self {
        let active = counts.active();
        let utilization = if counts.total > 0 {
            active as f64 / counts.total as f64
        } else {
            0.0
        };

        Self {
            available: true,
            total_connections: counts.total,
            active_connections: active,
            idle_connections: counts.idle,
            pending_acquires: counts.pending,
            utilization,
            timestamp: Utc::now(),
        }
    }

    /// Status reported when the client is unavailable.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            total_connections: 0,
            active_connections: 0,
            idle_connections: 0,
            pending_acquires: 0,
            utilization: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// Metrics accumulated from pool samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub samples: u64,
    pub unavailable_samples: u64,
    pub peak_active: u64,
    pub peak_pending: u64,
    pub peak_utilization: f64,
}

/// Samples pool occupancy from a [`DatabaseClient`].
#[derive(Debug, Default)]
pub struct PoolMonitor {
    samples: AtomicU64,
    unavailable_samples: AtomicU64,
    peak_active: AtomicU64,
    peak_pending: AtomicU64,
    // f64 bits; utilization is non-negative so bit order matches numeric order.
    peak_utilization: AtomicU64,
}

impl PoolMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read live pool counters. Never fails; see [`PoolStatus::unavailable`].
    pub fn pool_status(&self, client: &dyn DatabaseClient) -> PoolStatus {
        client
            .pool_counts()
            .map(PoolStatus::from_counts)
            .unwrap_or_else(PoolStatus::unavailable)
    }

    /// Read live pool counters and fold them into the accumulated metrics.
    pub fn sample(&self, client: &dyn DatabaseClient) -> PoolStatus {
        let status = self.pool_status(client);

        self.samples.fetch_add(1, Ordering::Relaxed);
        if !status.available {
            self.unavailable_samples.fetch_add(1, Ordering::Relaxed);
            return status;
        }

        self.peak_active
            .fetch_max(status.active_connections as u64, Ordering::Relaxed);
        self.peak_pending
            .fetch_max(status.pending_acquires as u64, Ordering::Relaxed);
        self.peak_utilization
            .fetch_max(status.utilization.to_bits(), Ordering::Relaxed);

        debug!(
            total = status.total_connections,
            active = status.active_connections,
            idle = status.idle_connections,
            pending = status.pending_acquires,
            "Pool sampled"
        );

        status
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            samples: self.samples.load(Ordering::Relaxed),
            unavailable_samples: self.unavailable_samples.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
            peak_pending: self.peak_pending.load(Ordering::Relaxed),
            peak_utilization: f64::from_bits(self.peak_utilization.load(Ordering::Relaxed)),
        }
    }

    /// Clear accumulated metrics. The client's pool is not affected.
    pub fn reset_metrics(&self) {
        self.samples.store(0, Ordering::Relaxed);
        self.unavailable_samples.store(0, Ordering::Relaxed);
        self.peak_active.store(0, Ordering::Relaxed);
        self.peak_pending.store(0, Ordering::Relaxed);
        self.peak_utilization.store(0, Ordering::Relaxed);
    }

    /// Sample the pool on an interval until shutdown.
    pub fn spawn_sampler(
        self: Arc<Self>,
        client: Arc<dyn DatabaseClient>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sample(client.as_ref());
                    }
                    _ = shutdown.recv() => {
                        debug!("Pool sampler stopped");
                        break;
                    }
                }
            }
        })
    }
}
