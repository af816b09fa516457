//! Configuration management for the Warmway engine.
//!
//! Handles server binding, database location, and engine tuning knobs.
//! Everything is overridable through `WARMWAY_*` environment variables for
//! container deployment.

use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Workflow engine tuning
    pub engine: EngineConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the SQLite database file (default: "data")
    pub data_dir: String,
}

/// Engine tuning knobs consumed by the coordinator, guard, and poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between due-task polling sweeps
    pub poll_interval_secs: u64,
    /// Maximum due tasks fetched per sweep
    pub poll_batch_size: i64,
    /// Default cap on goto-edge traversals when a step declares none.
    /// Finite on purpose: an unconfigured loop must not run forever.
    pub default_goto_limit: u32,
    /// Bounded wait for the per-account guard before reporting LockTimeout
    pub lock_timeout_ms: u64,
    /// Automation-platform endpoint for the HTTP action dispatcher.
    /// When unset, actions are executed by the logging dispatcher.
    pub dispatch_url: Option<String>,
    /// Outer timeout for dispatcher HTTP calls
    pub dispatch_timeout_ms: u64,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment.
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("WARMWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("WARMWAY_PORT")
                    .unwrap_or_else(|_| "3010".to_string())
                    .parse()
                    .unwrap_or(3010),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("WARMWAY_DATA_DIR")
                    .unwrap_or_else(|_| "data".to_string()),
            },
            engine: EngineConfig {
                poll_interval_secs: env_u64("WARMWAY_POLL_INTERVAL_SECS", 5),
                poll_batch_size: env_u64("WARMWAY_POLL_BATCH_SIZE", 100) as i64,
                default_goto_limit: env_u64("WARMWAY_GOTO_LIMIT", 1000) as u32,
                lock_timeout_ms: env_u64("WARMWAY_LOCK_TIMEOUT_MS", 5000),
                dispatch_url: std::env::var("WARMWAY_DISPATCH_URL").ok(),
                dispatch_timeout_ms: env_u64("WARMWAY_DISPATCH_TIMEOUT_MS", 30_000),
            },
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
