//! Error taxonomy for the pipeline.
//!
//! Each component owns one error enum. Only [`ApiError`] knows about HTTP;
//! everything else is transport-agnostic so the worker binary can share it.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

// ---

/// A batch upload was rejected as a whole. No store mutation happened.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidBatchError {
    #[error("Request body must be an array")]
    NotAnArray,

    #[error("No sensor readings provided")]
    Empty,

    #[error("Invalid reading at index {index}: {reason}")]
    InvalidReading { index: usize, reason: String },
}

/// Failure talking to the reading store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A reading handed to the store failed its own checks.
    #[error("invalid reading: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be mapped back into a reading.
    #[error("corrupt reading row: {0}")]
    CorruptRow(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The job was reclaimed by another worker after its lease expired.
    #[error("job {0} is no longer leased by this worker")]
    LeaseLost(Uuid),

    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt job row: {0}")]
    CorruptRow(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache value is not valid JSON for this key: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Raised by a job handler; routed to the queue's retry/dead-letter path.
#[derive(Debug, Error)]
pub enum JobProcessingError {
    #[error("invalid payload for {kind} job: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Outcome of a failed ingestion call.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    InvalidBatch(#[from] InvalidBatchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---

/// HTTP-facing error. Server-side variants carry a generic message only;
/// handlers log the underlying cause before converting.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    InvalidBatch(#[from] InvalidBatchError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(&'static str),
}

/// JSON body of every error response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        // ---
        match self {
            ApiError::InvalidBatch(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Any unreadable upload body is reported the same way as a non-array one.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::debug!(%rejection, "rejected request body");
        ApiError::InvalidBatch(InvalidBatchError::NotAnArray)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
