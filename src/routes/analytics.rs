use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::non_empty;
use crate::analytics::{
    build_report, day_window, AnalyticsQuery, AnalyticsReport, DEFAULT_HOURS, MAX_HOURS,
};
use crate::cache::{daily_stats_key, ResultCache};
use crate::error::ApiError;
use crate::models::DailyStatistic;
use crate::AppState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/analytics", get(report))
        .route("/analytics/daily", get(daily))
}

#[derive(Debug, Deserialize)]
struct ReportParams {
    field_id: Option<String>,
    hours: Option<String>,
}

/// `GET /analytics`: dashboard report computed from the reading store.
async fn report(
    Query(params): Query<ReportParams>,
    State(state): State<AppState>,
) -> Result<Json<AnalyticsReport>, ApiError> {
    // ---
    let hours = match non_empty(params.hours) {
        None => DEFAULT_HOURS,
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(h) if (1..=MAX_HOURS).contains(&h) => h,
            _ => {
                return Err(ApiError::BadRequest(format!(
                    "hours must be an integer between 1 and {MAX_HOURS}"
                )))
            }
        },
    };
    let query = AnalyticsQuery {
        field_id: non_empty(params.field_id),
        hours,
    };

    let report = build_report(state.store.as_ref(), &query, Utc::now())
        .await
        .map_err(|e| {
            error!(error = %e, "GET /analytics - failed to build report");
            ApiError::Internal("Failed to fetch analytics")
        })?;

    info!(
        total = report.summary.total_readings,
        "GET /analytics - report built"
    );
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct DailyParams {
    date: Option<String>,
}

#[derive(Serialize)]
struct DailyResponse {
    success: bool,
    date: NaiveDate,
    key: String,
    data: Vec<DailyStatistic>,
}

/// `GET /analytics/daily`: the cached daily aggregate for one local day.
async fn daily(
    Query(params): Query<DailyParams>,
    State(state): State<AppState>,
) -> Result<Json<DailyResponse>, ApiError> {
    // ---
    let date = match non_empty(params.date) {
        None => day_window(Utc::now()).0,
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map_err(|_| ApiError::BadRequest("date must be formatted YYYY-MM-DD".to_string()))?,
    };

    let cached = state.cache.get_daily_stats(date).await.map_err(|e| {
        error!(error = %e, %date, "GET /analytics/daily - cache read failed");
        ApiError::Internal("Failed to fetch daily statistics")
    })?;

    match cached {
        Some(data) => Ok(Json(DailyResponse {
            success: true,
            date,
            key: daily_stats_key(date),
            data,
        })),
        None => Err(ApiError::NotFound(format!(
            "No daily statistics cached for {date}"
        ))),
    }
}
