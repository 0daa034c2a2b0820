//! Application entry point for the `fieldpulse` API server.
//!
//! Startup sequence:
//! - Load `.env` and configuration from the environment
//! - Initialize structured logging/tracing
//! - Build the reading store, job queue and result cache (creating the
//!   Postgres schema when that backend is selected)
//! - Spawn the embedded aggregation worker unless `WORKER_EMBEDDED=false`
//! - Serve the API until Ctrl+C, then let the worker finish its job
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required** for `STORE_BACKEND=postgres`)
//! - `HTTP_ADDR` (optional) – bind address (default: `0.0.0.0:8080`)
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config.rs` for the full list.

use anyhow::Result;
use axum::Router;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;

use fieldpulse::{backends::Backends, cancel_on_ctrl_c, config, routes, telemetry};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    telemetry::init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let backends = Backends::connect(&cfg).await?;
    let shutdown = CancellationToken::new();

    let worker = if cfg.worker_embedded {
        let worker = backends.worker(cfg.worker_options());
        Some(tokio::spawn(worker.run(shutdown.clone())))
    } else {
        tracing::info!("Embedded worker disabled; run fieldpulse-worker separately");
        None
    };

    // Build app from routes gateway
    let app: Router = routes::router(backends.app_state(cfg.queue.enqueue_options()));

    let listener = tokio::net::TcpListener::bind(cfg.http_addr).await?;
    tracing::info!("Listening on {}", cfg.http_addr);

    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    shutdown.cancel();
    if let Some(worker) = worker {
        worker.await?;
    }

    tracing::info!("Server stopped");
    Ok(())
}
