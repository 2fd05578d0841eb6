use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_server::gateway::SqliteGateway;
use parley_server::{api, AppState, ServerConfig};
use parley_shared::constants::APP_NAME;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting {} chat server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open storage and build the routing core
    // -----------------------------------------------------------------------
    let gateway = SqliteGateway::open(&config.database_path)?;
    info!(path = %config.database_path.display(), "Database opened");

    let http_addr = config.http_addr;
    let app_state = AppState::new(config, Arc::new(gateway)).await?;

    // -----------------------------------------------------------------------
    // 4. Run the HTTP + WebSocket server until shutdown
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
