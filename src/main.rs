//! Application entry point for the `field-insights` backend service.
//!
//! This binary orchestrates the full startup sequence for the field sensor
//! ingestion and analytics API, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing PostgreSQL connection pools for the store and the task broker
//! - Creating the database schemas if they do not exist
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Starting the deferred task workers and the daily scheduler
//! - Binding the Axum HTTP server and serving requests
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `BROKER_URL` (optional) – task queue database (default: `DATABASE_URL`)
//! - `RUN_MODE` (optional) – `api`, `worker` or `all` (default: `all`)
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config` for the full list.
//!
//! This module follows the Explicit Module Boundary Pattern (EMBP) by
//! delegating schema setup to `schema`, configuration parsing to `config`,
//! persistence to `store` / `queue`, and route registration to `routes`.
use std::{env, io::IsTerminal, sync::Arc};

use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::Result;

mod config;
mod error;
mod models;
mod queue;
mod routes;
mod scheduler;
mod schema;
mod services;
mod store;
mod validation;
mod worker;

pub use config::Config;

use queue::{PgTaskQueue, TaskQueue};
use store::{PgStore, ReadingStore, RollupStore};

// ---

/// Shared handles passed to every route and worker.
///
/// Cloning is cheap; all members are reference counted.
#[derive(Clone)]
pub struct AppState {
    pub readings: Arc<dyn ReadingStore>,
    pub rollups: Arc<dyn RollupStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        readings: Arc<dyn ReadingStore>,
        rollups: Arc<dyn RollupStore>,
        queue: Arc<dyn TaskQueue>,
        config: Config,
    ) -> Self {
        Self {
            readings,
            rollups,
            queue,
            config: Arc::new(config),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let pool = connect("database", &cfg.db_url, cfg.db_pool_max).await?;
    schema::create_schema(&pool).await?;

    let broker_pool = if cfg.broker_url == cfg.db_url {
        pool.clone()
    } else {
        connect("broker", &cfg.broker_url, cfg.db_pool_max).await?
    };
    schema::create_queue_schema(&broker_pool).await?;

    let store = Arc::new(PgStore::new(pool));
    let state = AppState::new(
        store.clone(),
        store,
        Arc::new(PgTaskQueue::new(broker_pool)),
        cfg,
    );
    let mode = state.config.run_mode;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();
    if mode.runs_workers() {
        background.extend(worker::spawn_workers(&state, &shutdown_rx));
        background.push(tokio::spawn(scheduler::run(
            state.clone(),
            shutdown_rx.clone(),
        )));
    }

    if mode.serves_api() {
        // Build app from routes gateway (EMBP)
        let app: Router = routes::router(state.clone());

        let addr = format!("{}:{}", state.config.api_host, state.config.api_port);
        tracing::info!("Listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    tracing::info!("Shutting down");
    shutdown_tx.send(true).ok();
    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!("Background task ended abnormally: {}", e);
        }
    }

    Ok(())
}

// ---

async fn connect(name: &str, url: &str, max_connections: u32) -> Result<PgPool> {
    // ---
    tracing::info!("Attempting to connect to {}", name);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", name, e))?;

    tracing::info!("Successfully connected to {}", name);
    Ok(pool)
}

async fn shutdown_signal() {
    // ---
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AXUM_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `AXUM_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to AXUM_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
