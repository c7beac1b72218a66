//! Shutdown coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shutdown coordinator for graceful shutdown.
///
/// Background tasks subscribe to the shutdown broadcast and are registered
/// with [`track`](Self::track) so [`shutdown`](Self::shutdown) can wait for them.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Shutdown signal sender.
    sender: broadcast::Sender<()>,
    /// Shutdown initiated flag.
    initiated: Arc<AtomicBool>,
    /// Shutdown complete notifier.
    complete_tx: Arc<watch::Sender<bool>>,
    /// Shutdown complete receiver.
    complete_rx: watch::Receiver<bool>,
    /// Tasks to wait for.
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Shutdown timeout.
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        let (complete_tx, complete_rx) = watch::channel(false);

        Self {
            sender,
            initiated: Arc::new(AtomicBool::new(false)),
            complete_tx: Arc::new(complete_tx),
            complete_rx,
            tasks: Arc::new(Mutex::new(Vec::new())),
            timeout,
        }
    }

    /// Subscribe to shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// The broadcast sender, for components that subscribe their own tasks.
    pub fn sender(&self) -> &broadcast::Sender<()> {
        &self.sender
    }

    /// Wait for these tasks during shutdown.
    pub async fn track(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks.lock().await.extend(handles);
    }

    /// Check if shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Initiate shutdown.
    pub fn initiate(&self) {
        if self.initiated.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Initiating graceful shutdown...");
        let _ = self.sender.send(());
    }

    /// Initiate shutdown and wait for tracked tasks, up to the timeout.
    pub async fn shutdown(&self) {
        self.initiate();

        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let count = handles.len();
        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Background task failed during shutdown");
                }
            }
        };

        if tokio::time::timeout(self.timeout, drain).await.is_err() {
            warn!(
                tasks = count,
                timeout_secs = self.timeout.as_secs(),
                "Background tasks did not stop in time"
            );
        }

        self.complete();
    }

    /// Wait for shutdown completion.
    pub async fn wait_for_completion(&self) {
        let mut rx = self.complete_rx.clone();
        let _ = rx.wait_for(|&complete| complete).await;
    }

    /// Mark shutdown as complete.
    pub fn complete(&self) {
        info!("Shutdown complete");
        let _ = self.complete_tx.send(true);
    }

    /// Get shutdown timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Resolve on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_stops_subscribed_tasks() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut rx = coordinator.subscribe();
        let handle = tokio::spawn(async move {
            let _ = rx.recv().await;
        });
        coordinator.track([handle]).await;

        coordinator.shutdown().await;

        assert!(coordinator.is_shutting_down());
        coordinator.wait_for_completion().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_after_timeout() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let stuck = tokio::spawn(std::future::pending::<()>());
        coordinator.track([stuck]).await;

        coordinator.shutdown().await;
        coordinator.wait_for_completion().await;
    }

    #[test]
    fn test_initiate_is_idempotent() {
        let coordinator = ShutdownCoordinator::default();
        let mut rx = coordinator.subscribe();

        coordinator.initiate();
        coordinator.initiate();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
