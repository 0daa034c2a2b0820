use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{ApiError, IngestError};
use crate::AppState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/ingest", post(handler))
}

#[derive(Serialize)]
struct IngestResponse {
    success: bool,
    count: usize,
}

/// `POST /ingest`: replace the stored readings with the uploaded batch.
async fn handler(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    // ---
    let Json(body) = body?;

    match state.ingestor.ingest(&body).await {
        Ok(report) => {
            info!(
                count = report.count,
                queued = report.job.is_some(),
                "POST /ingest - batch stored"
            );
            Ok((
                StatusCode::CREATED,
                Json(IngestResponse {
                    success: true,
                    count: report.count,
                }),
            ))
        }
        Err(IngestError::InvalidBatch(e)) => {
            warn!(error = %e, "POST /ingest - batch rejected");
            Err(e.into())
        }
        Err(IngestError::Store(e)) => {
            error!(error = %e, "POST /ingest - failed to store batch");
            Err(ApiError::Internal("Failed to save sensor readings"))
        }
    }
}
