//! PostgreSQL client backed by an sqlx pool.

use super::{DatabaseClient, PoolCounts, TransactionHandle, TransactionalClient};
use crate::config::DbConfig;
use crate::error::{DbError, DbResult};
use crate::leak::LeakDetector;
use crate::transaction::TransactionOptions;
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::{
    pool::PoolConnection,
    postgres::{PgConnectOptions, PgPoolOptions},
    Connection, PgConnection, PgPool, Postgres, Transaction,
};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

type LeaseSlot = Arc<Mutex<Option<PoolConnection<Postgres>>>>;

/// Exclusive access to a tracked connection.
pub type ConnectionGuard = OwnedMappedMutexGuard<Option<PoolConnection<Postgres>>, PoolConnection<Postgres>>;

/// Create a database connection pool.
pub async fn create_pool(config: &DbConfig) -> DbResult<PgPool> {
    info!("Creating database connection pool...");

    let connect_options = PgConnectOptions::from_str(&config.url)?
        .statement_cache_capacity(config.statement_cache_size);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout())
        .idle_timeout(Some(config.idle_timeout()))
        .max_lifetime(Some(config.max_lifetime()))
        .connect_with(connect_options)
        .await?;

    sqlx::query("SELECT 1").fetch_one(&pool).await?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database pool created"
    );

    Ok(pool)
}

struct PgClientInner {
    pool: PgPool,
    leases: DashMap<String, LeaseSlot>,
    pending: AtomicU32,
    leaks: Arc<LeakDetector>,
}

/// PostgreSQL client whose checked-out connections are reported to a [`LeakDetector`].
#[derive(Clone)]
pub struct PgClient {
    inner: Arc<PgClientInner>,
}

impl PgClient {
    /// Connect a new pool and wrap it.
    pub async fn connect(config: &DbConfig, leaks: Arc<LeakDetector>) -> DbResult<Self> {
        let pool = create_pool(config).await?;
        Ok(Self::from_pool(pool, leaks))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, leaks: Arc<LeakDetector>) -> Self {
        Self {
            inner: Arc::new(PgClientInner {
                pool,
                leases: DashMap::new(),
                pending: AtomicU32::new(0),
                leaks,
            }),
        }
    }

    /// The underlying pool, for untracked queries.
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    /// Check out a connection and start tracking it.
    pub async fn acquire(&self) -> DbResult<TrackedConnection> {
        let conn = {
            let _pending = PendingAcquire::new(&self.inner.pending);
            self.inner.pool.acquire().await?
        };

        let id = Uuid::new_v4().to_string();
        let slot: LeaseSlot = Arc::new(Mutex::new(Some(conn)));
        self.inner.leases.insert(id.clone(), slot.clone());
        self.inner.leaks.record_acquire(&id);

        Ok(TrackedConnection {
            id,
            slot,
            inner: self.inner.clone(),
        })
    }

    /// Number of connections currently checked out through [`PgClient::acquire`].
    pub fn tracked_leases(&self) -> usize {
        self.inner.leases.len()
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.inner.pool.close().await;
    }
}

#[async_trait]
impl DatabaseClient for PgClient {
    fn pool_counts(&self) -> Option<PoolCounts> {
        let pool = &self.inner.pool;
        if pool.is_closed() {
            return None;
        }

        Some(PoolCounts {
            total: pool.size(),
            idle: pool.num_idle() as u32,
            pending: self.inner.pending.load(Ordering::SeqCst),
        })
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.inner.pool).await?;
        Ok(())
    }

    async fn force_release(&self, connection_id: &str) -> DbResult<()> {
        let slot = self
            .inner
            .leases
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DbError::UnknownConnection {
                id: connection_id.to_string(),
            })?;

        let mut guard = slot.try_lock_owned().map_err(|_| DbError::ConnectionBusy {
            id: connection_id.to_string(),
        })?;

        let Some(conn) = guard.take() else {
            debug!(connection_id, "Connection already released");
            return Ok(());
        };
        drop(guard);

        self.inner.leases.remove(connection_id);
        self.inner.leaks.record_release(connection_id);

        warn!(connection_id, "Connection force-released");

        // Detach so a connection possibly left mid-transaction is not reused.
        // The holder has already lost it, so a failed close is not a failed release.
        if let Err(e) = conn.detach().close().await {
            warn!(connection_id, error = %e, "Failed to close force-released connection");
        }
        Ok(())
    }

    async fn clear_idle_connections(&self) -> DbResult<u32> {
        let idle = self.inner.pool.num_idle();
        let mut closed = 0;

        for _ in 0..idle {
            match self.inner.pool.try_acquire() {
                Some(conn) => {
                    conn.detach().close().await?;
                    closed += 1;
                }
                None => break,
            }
        }

        debug!(closed, "Idle connections cleared");
        Ok(closed)
    }

    async fn analyze(&self) -> DbResult<()> {
        sqlx::query("ANALYZE").execute(&self.inner.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionalClient for PgClient {
    type Transaction = PgTransaction;

    async fn begin(&self, options: &TransactionOptions) -> DbResult<PgTransaction> {
        let mut tx = self.inner.pool.begin().await?;
        sqlx::query(&options.to_sql()).execute(&mut *tx).await?;
        Ok(PgTransaction { inner: Some(tx) })
    }
}

/// A connection checked out through [`PgClient::acquire`].
///
/// The release is recorded when the value is dropped.
pub struct TrackedConnection {
    id: String,
    slot: LeaseSlot,
    inner: Arc<PgClientInner>,
}

impl TrackedConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lock the connection for use.
    ///
    /// Fails once the connection has been force-released.
    pub async fn lock(&self) -> DbResult<ConnectionGuard> {
        let guard = self.slot.clone().lock_owned().await;
        OwnedMutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| {
            DbError::ConnectionReleased {
                id: self.id.clone(),
            }
        })
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.inner.leases.remove(&self.id);
        self.inner.leaks.record_release(&self.id);
    }
}

impl std::fmt::Debug for TrackedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedConnection").field("id", &self.id).finish()
    }
}

/// Transaction opened by [`PgClient`].
pub struct PgTransaction {
    inner: Option<Transaction<'static, Postgres>>,
}

impl PgTransaction {
    /// Connection to run statements on.
    pub fn conn(&mut self) -> DbResult<&mut PgConnection> {
        self.inner.as_deref_mut().ok_or(DbError::TransactionFinished)
    }
}

#[async_trait]
impl TransactionHandle for PgTransaction {
    async fn commit(&mut self) -> DbResult<()> {
        let tx = self.inner.take().ok_or(DbError::TransactionFinished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        // A transaction consumed by a failed commit is rolled back by sqlx on drop.
        match self.inner.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }
}

struct PendingAcquire<'a> {
    counter: &'a AtomicU32,
}

impl<'a> PendingAcquire<'a> {
    fn new(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_acquire_guard_restores_counter() {
        let counter = AtomicU32::new(0);
        {
            let _a = PendingAcquire::new(&counter);
            let _b = PendingAcquire::new(&counter);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lazy_pool_reports_counts() {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy("postgres://localhost/wirebase_test")
            .unwrap();
        let client = PgClient::from_pool(pool, Arc::new(LeakDetector::default()));

        let counts = client.pool_counts().unwrap();
        assert_eq!(counts.total, 0);
        assert_eq!(counts.pending, 0);
        assert_eq!(client.tracked_leases(), 0);
    }

    #[tokio::test]
    async fn test_force_release_unknown_connection() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/wirebase_test")
            .unwrap();
        let client = PgClient::from_pool(pool, Arc::new(LeakDetector::default()));

        let result = client.force_release("missing").await;
        assert!(matches!(result, Err(DbError::UnknownConnection { .. })));
    }

    const LIVE_DB: &str = "WIREBASE_TEST_DATABASE_URL";

    /// Client over the database named by `WIREBASE_TEST_DATABASE_URL`, if set.
    async fn live_client(max_connections: u32) -> Option<(PgClient, Arc<LeakDetector>)> {
        let url = std::env::var(LIVE_DB).ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await
            .unwrap();
        let leaks = Arc::new(LeakDetector::default());
        Some((PgClient::from_pool(pool, leaks.clone()), leaks))
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL at WIREBASE_TEST_DATABASE_URL"]
    async fn test_tracked_connection_reports_acquire_and_release() {
        let Some((client, leaks)) = live_client(2).await else {
            return;
        };

        let conn = client.acquire().await.unwrap();
        let id = conn.id().to_string();
        assert_eq!(client.tracked_leases(), 1);

        let history = leaks.connection_history();
        assert_eq!(history[0].id, id);
        assert!(!history[0].is_released());

        {
            let mut guard = conn.lock().await.unwrap();
            sqlx::query("SELECT 1").execute(&mut **guard).await.unwrap();
        }

        drop(conn);
        assert_eq!(client.tracked_leases(), 0);
        assert!(leaks.connection_history()[0].is_released());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL at WIREBASE_TEST_DATABASE_URL"]
    async fn test_force_released_holder_loses_connection() {
        let Some((client, leaks)) = live_client(2).await else {
            return;
        };

        let conn = client.acquire().await.unwrap();
        client.force_release(conn.id()).await.unwrap();

        assert!(matches!(
            conn.lock().await,
            Err(DbError::ConnectionReleased { .. })
        ));
        assert_eq!(client.tracked_leases(), 0);
        assert!(leaks.connection_history()[0].is_released());
        assert!(matches!(
            client.force_release(conn.id()).await,
            Err(DbError::UnknownConnection { .. })
        ));

        drop(conn);
        assert_eq!(leaks.history_len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL at WIREBASE_TEST_DATABASE_URL"]
    async fn test_locked_lease_is_busy() {
        let Some((client, leaks)) = live_client(2).await else {
            return;
        };

        let conn = client.acquire().await.unwrap();
        let guard = conn.lock().await.unwrap();

        let result = client.force_release(conn.id()).await;
        assert!(matches!(result, Err(DbError::ConnectionBusy { .. })));
        assert!(!leaks.connection_history()[0].is_released());

        drop(guard);
        client.force_release(conn.id()).await.unwrap();
        assert!(leaks.connection_history()[0].is_released());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL at WIREBASE_TEST_DATABASE_URL"]
    async fn test_waiting_acquire_counts_as_pending() {
        let Some((client, leaks)) = live_client(1).await else {
            return;
        };

        let held = client.acquire().await.unwrap();
        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.acquire().await.map(|c| c.id().to_string()) })
        };

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(client.pool_counts().unwrap().pending, 1);

        drop(held);
        let second = waiter.await.unwrap().unwrap();

        assert_eq!(client.pool_counts().unwrap().pending, 0);
        assert_eq!(leaks.connection_history()[0].id, second);
        assert_eq!(leaks.history_len(), 2);
    }

    #[tokio::test]
    async fn test_closed_pool_is_unavailable() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/wirebase_test")
            .unwrap();
        let client = PgClient::from_pool(pool, Arc::new(LeakDetector::default()));

        client.close().await;
        assert!(client.pool_counts().is_none());
    }
}
