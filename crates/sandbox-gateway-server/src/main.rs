use dotenvy::dotenv;
use sandbox_gateway_core::config::GatewaySettings;
use sandbox_gateway_core::sandbox::DockerDriver;
use sandbox_gateway_transport_ws::run_server;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenv().ok();

    init_logging();

    info!("Starting sandbox gateway...");

    let settings = init_settings();

    let driver = match DockerDriver::connect().await {
        Ok(driver) => driver,
        Err(e) => {
            error!("Failed to connect to Docker: {}", e);
            std::process::exit(1);
        }
    };
    info!("Docker driver initialized.");

    run_server(settings, Arc::new(driver)).await
}

fn init_logging() {
    let debug_mode = std::env::var("DEBUG_MODE")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let filter = if debug_mode {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "sandbox_gateway_core=info,sandbox_gateway_transport_ws=info,bollard=warn,hyper=warn,tower_http=info",
            )
        })
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn init_settings() -> GatewaySettings {
    match GatewaySettings::new() {
        Ok(settings) => {
            info!("Configuration loaded successfully.");
            settings
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}
