use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::non_empty;
use crate::error::ApiError;
use crate::models::{SensorReading, SensorType};
use crate::store::{ReadingFilter, ReadingStore};
use crate::AppState;

// ---

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/readings", get(handler))
}

#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    field_id: Option<String>,
    sensor_type: Option<String>,
    limit: Option<String>,
}

#[derive(Serialize)]
struct ReadingsResponse {
    success: bool,
    count: usize,
    data: Vec<SensorReading>,
}

/// `GET /readings`: newest-first readings, optionally filtered.
async fn handler(
    Query(params): Query<ReadingsQuery>,
    State(state): State<AppState>,
) -> Result<Json<ReadingsResponse>, ApiError> {
    // ---
    let mut filter = ReadingFilter::new();
    if let Some(field_id) = non_empty(params.field_id) {
        filter = filter.field(field_id);
    }
    if let Some(sensor_type) = non_empty(params.sensor_type) {
        let sensor_type: SensorType = sensor_type.parse().map_err(ApiError::BadRequest)?;
        filter = filter.sensor_type(sensor_type);
    }
    let limit = match non_empty(params.limit) {
        None => DEFAULT_LIMIT,
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => n.min(MAX_LIMIT),
            _ => {
                return Err(ApiError::BadRequest(
                    "limit must be a positive integer".to_string(),
                ))
            }
        },
    };

    let data: Vec<SensorReading> = state
        .store
        .query(filter, limit)
        .try_collect()
        .await
        .map_err(|e| {
            error!(error = %e, "GET /readings - query failed");
            ApiError::Internal("Failed to fetch sensor readings")
        })?;

    debug!(count = data.len(), "GET /readings - returning readings");
    Ok(Json(ReadingsResponse {
        success: true,
        count: data.len(),
        data,
    }))
}
