//! hass-ws probe entry point.
//!
//! Connects with the credentials from the environment, checks liveness
//! with a ping and prints the system-health aggregate as JSON.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use hass_ws::config::ClientConfig;
use hass_ws::service::AggregationService;
use hass_ws::ws::Connection;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let config = ClientConfig::from_env()?;
    let url = config.websocket_url()?;
    tracing::info!(server = %config.server, "starting hass-ws probe");

    // Connect and authenticate
    let connection = Arc::new(
        Connection::connect_with_options(&url, &config.token, config.connection_options())
            .await
            .with_context(|| format!("connecting to {url}"))?,
    );

    connection
        .ping(config.request_timeout)
        .await
        .context("ping")?;
    tracing::info!(version = connection.server_version().unwrap_or("unknown"), "server alive");

    let health = AggregationService::new(Arc::clone(&connection), &config)
        .system_health()
        .await
        .context("system health")?;
    println!("{}", serde_json::to_string_pretty(&health)?);

    connection.close().await;
    Ok(())
}
