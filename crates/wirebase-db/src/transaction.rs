//! Transaction helper utilities.

use crate::client::{TransactionHandle, TransactionalClient};
use crate::error::{DbError, DbResult, ErrorSignature};
use crate::instrumentation::{QueryLimits, QueryTimer};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn, Instrument};
use wirebase_common_log::spans::db_span;

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options applied right after `BEGIN`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TransactionOptions {
    pub fn isolation(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            ..Self::default()
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn to_sql(&self) -> String {
        let mut sql = format!("SET TRANSACTION ISOLATION LEVEL {}", self.isolation.to_sql());
        if self.read_only {
            sql.push_str(" READ ONLY");
        }
        sql
    }
}

/// Execute a function within a transaction.
///
/// Commits when `f` succeeds. When `f` or the commit fails the transaction is
/// rolled back and the original error is returned; a failing rollback is
/// logged and never replaces it.
pub async fn with_transaction<C, F, T, E>(client: &C, options: TransactionOptions, f: F) -> Result<T, E>
where
    C: TransactionalClient + ?Sized,
    F: for<'t> FnOnce(&'t mut C::Transaction) -> BoxFuture<'t, Result<T, E>>,
    E: From<DbError> + fmt::Display,
{
    run_transaction(client, options, f)
        .instrument(db_span("transaction"))
        .await
}

async fn run_transaction<C, F, T, E>(client: &C, options: TransactionOptions, f: F) -> Result<T, E>
where
    C: TransactionalClient + ?Sized,
    F: for<'t> FnOnce(&'t mut C::Transaction) -> BoxFuture<'t, Result<T, E>>,
    E: From<DbError> + fmt::Display,
{
    let mut tx = client.begin(&options).await?;
    debug!(
        isolation = options.isolation.to_sql(),
        read_only = options.read_only,
        "Transaction started"
    );

    let result = f(&mut tx).await;
    let outcome = match result {
        Ok(value) => tx.commit().await.map(|()| value).map_err(E::from),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(value) => {
            debug!("Transaction committed");
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!(
                    error = %e,
                    rollback_error = %rollback_err,
                    "Transaction rollback failed"
                );
            } else {
                debug!(error = %e, "Transaction rolled back");
            }
            Err(e)
        }
    }
}

/// Run a query future, abandoning the wait after `limits.timeout`.
///
/// Timing out only stops waiting; the statement may still run to completion
/// on the server.
pub async fn execute_query<F, T, E>(label: &str, limits: QueryLimits, query: F) -> DbResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<DbError>,
{
    let timer = QueryTimer::with_limits(label, &limits);

    match tokio::time::timeout(limits.timeout, query).await {
        Ok(result) => {
            timer.finish();
            result.map_err(Into::into)
        }
        Err(_) => {
            let timeout_ms = limits.timeout.as_millis() as u64;
            warn!(query = %label, timeout_ms, "Query timed out");
            Err(DbError::Timeout { timeout_ms })
        }
    }
}

/// Whether an error is a serialization failure worth retrying.
pub fn is_serialization_failure<E: ErrorSignature + ?Sized>(err: &E) -> bool {
    err.code().as_deref() == Some("40001")
        || err.message().to_lowercase().contains("could not serialize access")
}

/// Execute with automatic retry on serialization failures.
///
/// Makes at most `max_retries` attempts, sleeping 100ms times the attempt
/// number between them.
pub async fn with_retry<F, Fut, T, E>(max_retries: u32, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ErrorSignature,
{
    let mut attempts = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempts += 1;

                if is_serialization_failure(&e) && attempts < max_retries {
                    warn!(
                        attempt = attempts,
                        max_retries = max_retries,
                        "Serialization failure, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(100 * attempts as u64)).await;
                    continue;
                }

                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{MockClient, TestError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug, thiserror::Error)]
    enum AppError {
        #[error(transparent)]
        Db(#[from] DbError),

        #[error("insufficient scrap: {0}")]
        Insufficient(u32),
    }

    #[test]
    fn test_options_sql() {
        assert_eq!(
            TransactionOptions::default().to_sql(),
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED"
        );
        assert_eq!(
            TransactionOptions::isolation(IsolationLevel::Serializable)
                .read_only()
                .to_sql(),
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE READ ONLY"
        );
    }

    #[tokio::test]
    async fn test_commits_on_success() {
        let client = MockClient::new();

        let value: Result<u32, AppError> = with_transaction(
            &client,
            TransactionOptions::isolation(IsolationLevel::RepeatableRead),
            |tx| {
                Box::pin(async move {
                    tx.execute("UPDATE wallets SET scrap = scrap - 5")?;
                    Ok::<u32, AppError>(5)
                })
            },
        )
        .await;

        assert_eq!(assert_ok!(value), 5);
        assert_eq!(client.commits(), 1);
        assert_eq!(client.rollbacks(), 0);
        assert_eq!(
            client.begun_with(),
            vec![TransactionOptions::isolation(IsolationLevel::RepeatableRead)]
        );
    }

    #[tokio::test]
    async fn test_rolls_back_and_returns_original_error() {
        let client = MockClient::new();

        let result: Result<(), AppError> =
            with_transaction(&client, TransactionOptions::default(), |_tx| {
                Box::pin(async move { Err(AppError::Insufficient(3)) })
            })
            .await;

        assert!(matches!(result, Err(AppError::Insufficient(3))));
        assert_eq!(client.commits(), 0);
        assert_eq!(client.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_rollback_failure_does_not_mask_error() {
        let client = MockClient::new();
        client.fail_rollback("connection reset");

        let result: Result<(), AppError> =
            with_transaction(&client, TransactionOptions::default(), |_tx| {
                Box::pin(async move { Err(AppError::Insufficient(7)) })
            })
            .await;

        let err = assert_err!(result);
        assert!(matches!(err, AppError::Insufficient(7)));
        assert_eq!(err.to_string(), "insufficient scrap: 7");
        assert_eq!(client.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back() {
        let client = MockClient::new();
        client.fail_commit("could not serialize access due to concurrent update");

        let result: Result<u32, AppError> =
            with_transaction(&client, TransactionOptions::default(), |_tx| {
                Box::pin(async move { Ok(1) })
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("could not serialize access"));
        assert_eq!(client.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_begin_failure_is_returned() {
        let client = MockClient::new();
        client.set_unavailable();

        let result: Result<(), AppError> =
            with_transaction(&client, TransactionOptions::default(), |_tx| {
                Box::pin(async move { Ok(()) })
            })
            .await;

        assert!(matches!(result, Err(AppError::Db(DbError::Unavailable(_)))));
        assert_eq!(client.rollbacks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_query_times_out() {
        let limits = QueryLimits::default().with_timeout(Duration::from_millis(50));
        let start = Instant::now();

        let result = execute_query(
            "SELECT 1",
            limits,
            std::future::pending::<Result<(), DbError>>(),
        )
        .await;

        let elapsed = start.elapsed();
        let err = assert_err!(result);
        assert!(matches!(err, DbError::Timeout { timeout_ms: 50 }));
        assert_eq!(err.to_string(), "Query timeout after 50ms");
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_query_passes_result_through() {
        let limits = QueryLimits::default().with_timeout(Duration::from_millis(50));

        let ok = execute_query("SELECT 1", limits, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, sqlx::Error>(1)
        })
        .await;
        assert_eq!(ok.unwrap(), 1);

        let err = execute_query("SELECT 1", limits, async {
            Err::<(), _>(sqlx::Error::PoolTimedOut)
        })
        .await;
        assert!(matches!(err, Err(DbError::Sqlx(sqlx::Error::PoolTimedOut))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_serialization_failure() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        let result = with_retry(3, move || async move {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(TestError::new(Some("40001"), "could not serialize access"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        let result: Result<(), _> = with_retry(3, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TestError::new(Some("40001"), "could not serialize access"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        attempts.store(0, Ordering::SeqCst);
        let result: Result<(), _> = with_retry(3, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TestError::new(Some("23505"), "duplicate key"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
