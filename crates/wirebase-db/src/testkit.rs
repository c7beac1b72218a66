//! Scriptable in-memory client for tests.

use crate::client::{DatabaseClient, PoolCounts, TransactionHandle, TransactionalClient};
use crate::error::{DbError, DbResult, ErrorSignature};
use crate::transaction::TransactionOptions;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct Script {
    counts: Option<PoolCounts>,
    ping_latency: Duration,
    ping_error: Option<String>,
    analyze_error: Option<String>,
    commit_error: Option<String>,
    rollback_error: Option<String>,
    fail_release: HashSet<String>,
    release_delay: Duration,
    released: Vec<String>,
    begun: Vec<TransactionOptions>,
    statements: Vec<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            counts: Some(PoolCounts {
                total: 5,
                idle: 5,
                pending: 0,
            }),
            ping_latency: Duration::ZERO,
            ping_error: None,
            analyze_error: None,
            commit_error: None,
            rollback_error: None,
            fail_release: HashSet::new(),
            release_delay: Duration::ZERO,
            released: Vec::new(),
            begun: Vec::new(),
            statements: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    script: Mutex<Script>,
    pings: AtomicU64,
    analyzes: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// In-memory [`DatabaseClient`] whose behaviour is set by the test.
///
/// Starts with an idle pool of five connections and answers every call
/// successfully.
#[derive(Debug, Clone, Default)]
pub struct MockClient {
    state: Arc<MockState>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pool_counts(&self, counts: PoolCounts) {
        self.state.script.lock().counts = Some(counts);
    }

    /// Behave like a closed client: no pool counts and every call fails.
    pub fn set_unavailable(&self) {
        self.state.script.lock().counts = None;
    }

    pub fn set_ping_latency(&self, latency: Duration) {
        self.state.script.lock().ping_latency = latency;
    }

    pub fn fail_ping(&self, message: &str) {
        self.state.script.lock().ping_error = Some(message.to_string());
    }

    pub fn fail_analyze(&self, message: &str) {
        self.state.script.lock().analyze_error = Some(message.to_string());
    }

    pub fn fail_commit(&self, message: &str) {
        self.state.script.lock().commit_error = Some(message.to_string());
    }

    pub fn fail_rollback(&self, message: &str) {
        self.state.script.lock().rollback_error = Some(message.to_string());
    }

    /// Make `force_release` fail for this connection id.
    pub fn fail_release_of(&self, connection_id: &str) {
        self.state
            .script
            .lock()
            .fail_release
            .insert(connection_id.to_string());
    }

    /// Delay every `force_release` call by `delay` before it takes effect.
    pub fn set_release_delay(&self, delay: Duration) {
        self.state.script.lock().release_delay = delay;
    }

    /// Connection ids successfully force-released, in call order.
    pub fn released_ids(&self) -> Vec<String> {
        self.state.script.lock().released.clone()
    }

    /// Options of every transaction begun, in call order.
    pub fn begun_with(&self) -> Vec<TransactionOptions> {
        self.state.script.lock().begun.clone()
    }

    /// Statements executed inside transactions.
    pub fn statements(&self) -> Vec<String> {
        self.state.script.lock().statements.clone()
    }

    pub fn ping_count(&self) -> u64 {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn analyze_count(&self) -> u64 {
        self.state.analyzes.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.state.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u64 {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> DbResult<()> {
        if self.state.script.lock().counts.is_none() {
            return Err(DbError::Unavailable("client closed".to_string()));
        }
        Ok(())
    }
}

fn scripted_failure(message: &str) -> DbError {
    DbError::Sqlx(sqlx::Error::Protocol(message.to_string()))
}

#[async_trait]
impl DatabaseClient for MockClient {
    fn pool_counts(&self) -> Option<PoolCounts> {
        self.state.script.lock().counts
    }

    async fn ping(&self) -> DbResult<()> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        let (latency, error) = {
            let script = self.state.script.lock();
            (script.ping_latency, script.ping_error.clone())
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.check_available()?;

        match error {
            Some(message) => Err(DbError::Unavailable(message)),
            None => Ok(()),
        }
    }

    async fn force_release(&self, connection_id: &str) -> DbResult<()> {
        self.check_available()?;
        let delay = self.state.script.lock().release_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.state.script.lock();
        if script.fail_release.contains(connection_id) {
            return Err(DbError::ConnectionBusy {
                id: connection_id.to_string(),
            });
        }
        script.released.push(connection_id.to_string());
        Ok(())
    }

    async fn clear_idle_connections(&self) -> DbResult<u32> {
        self.check_available()?;
        let mut script = self.state.script.lock();
        let Some(counts) = script.counts.as_mut() else {
            return Ok(0);
        };
        let closed = counts.idle;
        counts.total = counts.total.saturating_sub(closed);
        counts.idle = 0;
        Ok(closed)
    }

    async fn analyze(&self) -> DbResult<()> {
        self.check_available()?;
        self.state.analyzes.fetch_add(1, Ordering::SeqCst);
        match self.state.script.lock().analyze_error.clone() {
            Some(message) => Err(scripted_failure(&message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TransactionalClient for MockClient {
    type Transaction = MockTransaction;

    async fn begin(&self, options: &TransactionOptions) -> DbResult<MockTransaction> {
        self.check_available()?;
        self.state.script.lock().begun.push(*options);
        Ok(MockTransaction {
            state: self.state.clone(),
            finished: false,
        })
    }
}

/// Transaction handed out by [`MockClient`].
#[derive(Debug)]
pub struct MockTransaction {
    state: Arc<MockState>,
    finished: bool,
}

impl MockTransaction {
    /// Record a statement. Fails once the transaction is finished.
    pub fn execute(&mut self, sql: &str) -> DbResult<()> {
        if self.finished {
            return Err(DbError::TransactionFinished);
        }
        self.state.script.lock().statements.push(sql.to_string());
        Ok(())
    }
}

#[async_trait]
impl TransactionHandle for MockTransaction {
    async fn commit(&mut self) -> DbResult<()> {
        if self.finished {
            return Err(DbError::TransactionFinished);
        }
        self.finished = true;
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        match self.state.script.lock().commit_error.clone() {
            Some(message) => Err(scripted_failure(&message)),
            None => Ok(()),
        }
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.finished = true;
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        match self.state.script.lock().rollback_error.clone() {
            Some(message) => Err(scripted_failure(&message)),
            None => Ok(()),
        }
    }
}

/// Error with a fixed code and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError {
    code: Option<String>,
    message: String,
}

impl TestError {
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TestError {}

impl ErrorSignature for TestError {
    fn code(&self) -> Option<String> {
        self.code.clone()
    }

    fn message(&self) -> String {
        self.message.clone()
    }
}
