//! # Support Chat Server
//!
//! This is the application entry point that initializes:
//! - Tracing/logging subsystem
//! - Configuration loading
//! - Database connection pool and migrations
//! - Redis broker
//! - HTTP/WebSocket server

use anyhow::Result;
use tracing::info;

use support_chat::config::Settings;
use support_chat::startup::Application;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let production = std::env::var("RUN_ENV").is_ok_and(|env| env == "production");

    // Initialize tracing subscriber for structured logging
    support_chat::telemetry::init_tracing(production);

    info!("Starting support chat server...");

    // Load configuration from environment and config files
    let settings = Settings::load()?;
    info!(
        host = %settings.server.host,
        port = %settings.server.port,
        environment = %settings.environment,
        "Configuration loaded"
    );

    // Build and run the application
    let application = Application::build(settings).await?;

    info!("Server ready to accept connections");
    application.run_until_stopped().await?;

    Ok(())
}
