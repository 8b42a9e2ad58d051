//! Serve command: run the FileHarbor server.
//!
//! Exit status is zero on graceful shutdown and non-zero on any fatal
//! startup error (bad configuration, missing CA, bind failure).

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use harbor_server::{HarborServer, ServerConfig};

pub async fn run(config_path: &Path) -> Result<()> {
    let config = ServerConfig::from_file(config_path)
        .with_context(|| format!("failed to load server config {}", config_path.display()))?;

    info!(
        host = %config.network.host,
        port = config.network.port,
        libraries = config.libraries.len(),
        "starting server"
    );

    let server = HarborServer::new(config).context("server startup failed")?;
    server
        .run_until_signalled()
        .await
        .context("server terminated with an error")?;

    info!("shutdown complete");
    Ok(())
}
