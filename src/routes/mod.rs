//! HTTP routes gateway. Each sibling module exports a subrouter; this
//! module merges them and attaches the shared state and request tracing.

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::AppState;

mod analytics;
mod health;
mod ingest;
mod jobs;
mod readings;

// ---

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(ingest::router())
        .merge(analytics::router())
        .merge(readings::router())
        .merge(jobs::router())
        .merge(health::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Treat `?key=` the same as an absent parameter.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
