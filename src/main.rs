//! Warmway: durable account lifecycle automation engine.
//!
//! Main entry point. Initializes configuration and starts the HTTP server
//! with the workflow engine, startup recovery, and the due-task poller.

use warmway::{config::Config, server::start_server};

/// Application entry point.
///
/// The server provides:
/// - Definition management API at /api/definitions/*
/// - Instance control surface at /api/instances/*
/// - Engine statistics at /api/stats
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3010 and a SQLite database
    // under ./data)
    let config = Config::default();

    // Start the server
    start_server(config).await?;

    Ok(())
}
