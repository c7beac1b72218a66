//! Database error types.

use std::io::ErrorKind;
use std::sync::Arc;
use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors raised by the database layer.
#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("Query timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Connection {id} was force-released")]
    ConnectionReleased { id: String },

    #[error("Connection {id} is in use and cannot be released")]
    ConnectionBusy { id: String },

    #[error("Unknown connection {id}")]
    UnknownConnection { id: String },

    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Transaction already finished")]
    TransactionFinished,
}

/// Code and message of an error, as inspected by the error classifier.
///
/// Codes are PostgreSQL SQLSTATE values where the database provided one,
/// socket error names (`ECONNREFUSED`, ...) for I/O failures, and
/// upper-case tags for failures raised by this crate.
pub trait ErrorSignature {
    fn code(&self) -> Option<String>;
    fn message(&self) -> String;
}

impl ErrorSignature for sqlx::Error {
    fn code(&self) -> Option<String> {
        match self {
            sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
            sqlx::Error::Io(io) => io_code(io.kind()).map(str::to_string),
            sqlx::Error::PoolTimedOut => Some("POOL_TIMEOUT".to_string()),
            sqlx::Error::PoolClosed => Some("POOL_CLOSED".to_string()),
            sqlx::Error::WorkerCrashed => Some("WORKER_CRASHED".to_string()),
            _ => None,
        }
    }

    fn message(&self) -> String {
        match self {
            sqlx::Error::Database(db_err) => db_err.message().to_string(),
            other => other.to_string(),
        }
    }
}

impl ErrorSignature for DbError {
    fn code(&self) -> Option<String> {
        match self {
            DbError::Sqlx(err) => err.code(),
            DbError::Timeout { .. } => Some("QUERY_TIMEOUT".to_string()),
            DbError::ConnectionReleased { .. } => Some("CONNECTION_RELEASED".to_string()),
            DbError::ConnectionBusy { .. } => Some("CONNECTION_BUSY".to_string()),
            DbError::UnknownConnection { .. } => None,
            DbError::Unavailable(_) => Some("ECONNREFUSED".to_string()),
            DbError::TransactionFinished => Some("25000".to_string()),
        }
    }

    fn message(&self) -> String {
        match self {
            DbError::Sqlx(err) => err.message(),
            other => other.to_string(),
        }
    }
}

impl<T: ErrorSignature + ?Sized> ErrorSignature for Arc<T> {
    fn code(&self) -> Option<String> {
        (**self).code()
    }

    fn message(&self) -> String {
        (**self).message()
    }
}

fn io_code(kind: ErrorKind) -> Option<&'static str> {
    match kind {
        ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        ErrorKind::ConnectionReset => Some("ECONNRESET"),
        ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        ErrorKind::NotConnected => Some("ENOTCONN"),
        ErrorKind::BrokenPipe => Some("EPIPE"),
        ErrorKind::TimedOut => Some("ETIMEDOUT"),
        _ => None,
    }
}
