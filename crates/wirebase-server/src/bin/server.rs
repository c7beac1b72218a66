//! Wirebase Server Binary

use anyhow::{bail, Result};
use tracing::info;
use wirebase_server::config::{load_config, validate_config};
use wirebase_server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = load_config()?;

    wirebase_common_log::init(config.logging.to_log_config())?;

    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            tracing::error!(%error, "Invalid configuration");
        }
        bail!("{} configuration error(s)", errors.len());
    }

    info!("Starting Wirebase Server v{}", env!("CARGO_PKG_VERSION"));

    let server = Server::new(config).await?;
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}
