//! Wirebase API Server
//!
//! HTTP surface for the database monitoring subsystem in `wirebase-db`.
//!
//! # Architecture
//!
//! The server is built on Axum:
//!
//! - **Routes**: the `/db/*` admin endpoints
//! - **Middleware**: admin authentication and the database error boundary
//! - **Shutdown**: signal handling and background task draining

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod middleware;
pub mod response;
pub mod routes;
pub mod shutdown;
pub mod state;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::Router;
use shutdown::{shutdown_signal, ShutdownCoordinator};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use wirebase_db::{DbAdmin, LeakConfig, LeakDetector, PgClient};

/// Server builder for constructing and running the API server.
pub struct Server {
    config: ServerConfig,
    state: AppState,
    client: PgClient,
    shutdown: ShutdownCoordinator,
}

impl Server {
    /// Connect to the database and build the monitoring components.
    pub async fn new(config: ServerConfig) -> Result<Self, anyhow::Error> {
        let monitoring = config.database.monitoring.clone();
        let leaks = Arc::new(LeakDetector::new(LeakConfig::from(&monitoring)));
        let client = PgClient::connect(&config.database, leaks.clone()).await?;

        let admin = DbAdmin::new(Arc::new(client.clone()), leaks, monitoring);
        let state = AppState::new(Arc::new(admin)).with_admin_token(config.auth.admin_token.clone());
        let shutdown = ShutdownCoordinator::new(config.server.shutdown_timeout());

        Ok(Self {
            config,
            state,
            client,
            shutdown,
        })
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        routes::create_router(self.state.clone(), self.config.server.request_timeout())
    }

    /// Database client for application queries and transactions.
    pub fn client(&self) -> &PgClient {
        &self.client
    }

    /// Run the server until a shutdown signal, then stop the monitors and close the pool.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let addr = self.addr()?;
        let listener = TcpListener::bind(addr).await?;

        let monitors = self.state.db().spawn_background(self.shutdown.sender());
        self.shutdown.track(monitors).await;

        info!("Server listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.shutdown.shutdown().await;
        self.client.close().await;

        Ok(())
    }

    /// Get the server's socket address.
    pub fn addr(&self) -> Result<SocketAddr, anyhow::Error> {
        Ok(self.config.server.socket_addr()?)
    }
}
