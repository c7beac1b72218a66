//! Database client abstraction.
//!
//! The monitoring components never touch pool internals. They observe the
//! pool and act on it only through these traits:
//! - [`DatabaseClient`] for pool counters, pings, forced releases and maintenance
//! - [`TransactionalClient`] for scoped transactions
//!
//! [`PgClient`] implements both over an sqlx `PgPool`.

pub mod postgres;

pub use postgres::{create_pool, ConnectionGuard, PgClient, PgTransaction, TrackedConnection};

use crate::error::DbResult;
use crate::transaction::TransactionOptions;
use async_trait::async_trait;
use serde::Serialize;

/// Live pool counters as reported by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    /// Open connections (idle and checked out).
    pub total: u32,
    /// Connections sitting idle in the pool.
    pub idle: u32,
    /// Callers currently waiting for a connection.
    pub pending: u32,
}

impl PoolCounts {
    pub fn active(&self) -> u32 {
        self.total.saturating_sub(self.idle)
    }
}

/// Operations the monitors need from the underlying database client.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Current pool counters, or `None` when the client is unavailable.
    fn pool_counts(&self) -> Option<PoolCounts>;

    /// Trivial round-trip query.
    async fn ping(&self) -> DbResult<()>;

    /// Take a checked-out connection away from its holder and close it.
    ///
    /// Releasing a connection that was already force-released is a no-op.
    async fn force_release(&self, connection_id: &str) -> DbResult<()>;

    /// Close connections currently idle in the pool. Returns how many were closed.
    async fn clear_idle_connections(&self) -> DbResult<u32>;

    /// Refresh planner statistics.
    async fn analyze(&self) -> DbResult<()>;
}

/// A transaction opened by a [`TransactionalClient`].
#[async_trait]
pub trait TransactionHandle: Send {
    async fn commit(&mut self) -> DbResult<()>;
    async fn rollback(&mut self) -> DbResult<()>;
}

/// A client able to open transactions.
#[async_trait]
pub trait TransactionalClient: Send + Sync {
    type Transaction: TransactionHandle;

    async fn begin(&self, options: &TransactionOptions) -> DbResult<Self::Transaction>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_never_underflows() {
        let counts = PoolCounts { total: 2, idle: 5, pending: 0 };
        assert_eq!(counts.active(), 0);

        let counts = PoolCounts { total: 8, idle: 3, pending: 1 };
        assert_eq!(counts.active(), 5);
    }
}
