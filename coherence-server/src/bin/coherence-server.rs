//! Coherence Server Entry Point
//!
//! Reads configuration from the environment, installs tracing, and serves
//! node channels over TCP until interrupted.

use coherence_core::{ChannelError, CoherenceConfig, CoherenceResult};
use coherence_server::{
    init_tracing, serve_tcp, CoherenceServer, InMemoryValueStore, TelemetryConfig,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> CoherenceResult<()> {
    let telemetry_config = TelemetryConfig::from_env();
    init_tracing(&telemetry_config)?;

    let config = CoherenceConfig::from_env();
    let server = Arc::new(CoherenceServer::new(
        config.clone(),
        Arc::new(InMemoryValueStore::new()),
    )?);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(ChannelError::from)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let accept_loop = tokio::spawn(serve_tcp(Arc::clone(&server), listener, shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");

    shutdown_tx.send_replace(true);
    server.shutdown();

    match accept_loop.await {
        Ok(result) => result,
        Err(e) => Err(ChannelError::ShutDown {
            reason: format!("accept loop panicked: {}", e),
        }
        .into()),
    }
}
