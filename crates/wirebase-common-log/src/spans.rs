//! Span helpers for database operations.

use tracing::{info_span, Span};

/// Create a span for a database operation.
pub fn db_span(operation: &str) -> Span {
    info_span!("db", op = %operation)
}

/// Create a span for an HTTP request, with an empty `error` field for [`record_error`].
pub fn request_span(method: &str, path: &str) -> Span {
    info_span!(
        "request",
        method = %method,
        path = %path,
        error = tracing::field::Empty
    )
}

/// Record an error on the current span.
pub fn record_error(error: &dyn std::error::Error) {
    Span::current().record("error", tracing::field::display(error));
}

/// Timing utility for operations.
pub struct Timer {
    start: std::time::Instant,
    operation: &'static str,
}

impl Timer {
    /// Start a new timer.
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: std::time::Instant::now(),
            operation,
        }
    }

    /// Complete the timer, log and return the duration.
    pub fn finish(self) -> std::time::Duration {
        let duration = self.start.elapsed();
        tracing::debug!(
            operation = %self.operation,
            duration_ms = %duration.as_millis(),
            "operation completed"
        );
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Instrument;
    use tracing_subscriber::EnvFilter;

    fn with_subscriber<F>(f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let subscriber = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(EnvFilter::new("trace"))
            .finish();

        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn test_db_span_nesting() {
        with_subscriber(|| {
            let request = request_span("GET", "/db/status");
            let _guard1 = request.enter();

            let db = db_span("check_health");
            let _guard2 = db.enter();

            let error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
            record_error(&error);

            tracing::info!("nested operation");
        });
    }

    #[tokio::test]
    async fn test_span_propagates_across_await() {
        async {
            tracing::info!("maintenance running");
        }
        .instrument(db_span("maintenance"))
        .await;
    }

    #[test]
    fn test_timer_reports_elapsed() {
        let timer = Timer::start("test_operation");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.finish() >= std::time::Duration::from_millis(10));
    }
}
