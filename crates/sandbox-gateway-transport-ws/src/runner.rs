use anyhow::Context;
use sandbox_gateway_core::config::GatewaySettings;
use sandbox_gateway_core::sandbox::RuntimeDriver;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::routes::router;
use crate::state::AppState;

/// Serve the control surface and relay until Ctrl+C.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_server(
    settings: GatewaySettings,
    driver: Arc<dyn RuntimeDriver>,
) -> anyhow::Result<()> {
    let bind_addr = settings.bind_addr.clone();
    let relay_endpoint = settings.relay_endpoint();
    let state = AppState::new(driver, settings);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, relay = %relay_endpoint, "Sandbox gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Sandbox gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
