//! Server setup and initialization.
//!
//! Wires together all components — storage, registry, store, guard,
//! dispatcher, coordinator — then runs startup recovery, starts the task
//! poller, and serves the HTTP control surface. Recovery always completes
//! before the poller starts and before any route can accept work.

use crate::{
    api::{
        definitions::{create_definition_routes, DefinitionAppState},
        instances::{create_instance_routes, EngineAppState},
    },
    config::Config,
    engine::{
        coordinator::ExecutionCoordinator,
        dispatcher::{ActionDispatcher, HttpActionDispatcher, LoggingDispatcher},
        guard::AccountGuard,
        notify::{LogSink, NotificationSink},
        recovery::RecoveryManager,
        scheduler::StepScheduler,
        store::InstanceStore,
    },
    runtime::poller::TaskPoller,
    workflow::{registry::DefinitionRegistry, storage::DefinitionStorage},
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Create the main Axum application with all routes, run recovery, and
/// start the background poller.
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    std::fs::create_dir_all(&config.database.data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory: {e}"))?;

    let db_path = Path::new(&config.database.data_dir).join("warmway.db");
    tracing::info!("🗄️ Opening engine database: {}", db_path.display());
    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;

    tracing::info!("📋 Initializing definition storage");
    let storage = DefinitionStorage::new(pool.clone());
    storage.init_schema().await?;

    tracing::info!("🗃️ Initializing instance store");
    let store = Arc::new(InstanceStore::new(pool));
    store.init_schema().await?;

    tracing::info!("📊 Initializing definition registry");
    let registry = Arc::new(DefinitionRegistry::new(storage.clone()));
    registry.init_from_storage().await?;

    let guard = Arc::new(AccountGuard::new(Duration::from_millis(
        config.engine.lock_timeout_ms,
    )));
    let scheduler = Arc::new(StepScheduler::new(Arc::clone(&store)));
    let notifier = Arc::new(LogSink);

    let dispatcher: Arc<dyn ActionDispatcher> = match &config.engine.dispatch_url {
        Some(url) => {
            tracing::info!("📡 Using HTTP action dispatcher: {url}");
            Arc::new(HttpActionDispatcher::new(
                url.clone(),
                Duration::from_millis(config.engine.dispatch_timeout_ms),
            )?)
        }
        None => {
            tracing::warn!("🧪 No WARMWAY_DISPATCH_URL set, actions run in dry-run mode");
            Arc::new(LoggingDispatcher)
        }
    };

    tracing::info!("⚙️ Initializing execution coordinator");
    let coordinator = Arc::new(ExecutionCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&scheduler),
        Arc::clone(&guard),
        dispatcher,
        Arc::clone(&registry),
        Arc::clone(&notifier) as Arc<dyn NotificationSink>,
        config.engine.default_goto_limit,
    ));

    // recovery runs to completion before any new work is accepted
    tracing::info!("♻️ Running startup recovery");
    let recovery = RecoveryManager::new(
        Arc::clone(&store),
        Arc::clone(&scheduler),
        Arc::clone(&guard),
        Arc::clone(&registry),
        Arc::clone(&notifier) as Arc<dyn NotificationSink>,
    );
    let report = recovery.recover_all().await?;
    tracing::info!(
        "♻️ Recovery report: {} recovered, {} failed",
        report.recovered,
        report.failed
    );

    tracing::info!("⏰ Starting task poller");
    let poller = Arc::new(
        TaskPoller::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            Duration::from_secs(config.engine.poll_interval_secs),
            config.engine.poll_batch_size,
        )
        .await?,
    );
    poller.start().await?;

    tracing::info!("📡 Creating HTTP router");
    let definition_state = DefinitionAppState {
        storage,
        registry,
    };
    let engine_state = EngineAppState {
        coordinator,
        store,
        poller,
    };

    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_definition_routes().with_state(definition_state))
        .merge(create_instance_routes().with_state(engine_state));

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration.
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Warmway server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{bind_addr}");

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Health check endpoint handler.
async fn health_check() -> &'static str {
    "ok"
}
