//! `fieldpulse`: farm sensor ingestion with a queued daily-analytics worker.
//!
//! The HTTP API ingests reading batches and serves analytics; the worker
//! consumes the jobs ingestion enqueues. Both binaries build their
//! components through [`backends::Backends`] so neither reaches for global
//! connections.

pub mod analytics;
pub mod backends;
pub mod cache;
pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod queue;
pub mod routes;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod worker;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use config::Config;

use crate::cache::ResultCache;
use crate::ingest::Ingestor;
use crate::queue::JobQueue;
use crate::store::ReadingStore;

// ---

/// Handles shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReadingStore>,
    pub queue: Arc<dyn JobQueue>,
    pub cache: Arc<dyn ResultCache>,
    pub ingestor: Ingestor,
}

/// Cancel `token` on Ctrl+C. If the signal handler cannot be installed the
/// process keeps running and the error is logged.
pub async fn cancel_on_ctrl_c(token: CancellationToken) {
    // ---
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("shutdown signal received");
            token.cancel();
        }
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
    }
}
