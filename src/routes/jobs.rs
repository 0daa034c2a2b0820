use axum::{extract::State, routing::get, Json, Router};

use crate::error::ApiError;
use crate::queue::{JobQueue, QueueStats};
use crate::AppState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/jobs/stats", get(handler))
}

/// `GET /jobs/stats`: job counts per state.
async fn handler(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    // ---
    state.queue.stats().await.map(Json).map_err(|e| {
        tracing::error!(error = %e, "GET /jobs/stats - queue unavailable");
        ApiError::Internal("Failed to fetch queue stats")
    })
}
