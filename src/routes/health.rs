// src/routes/health.rs
//! Liveness probe. Static, so it answers even when Postgres is down.

use axum::{routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct Liveness {
    status: &'static str,
}

async fn liveness() -> Json<Liveness> {
    Json(Liveness { status: "ok" })
}

/// `GET /health`, generic over the gateway state.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/health", get(liveness))
}
