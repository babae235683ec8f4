// =============================================================================
// ERROR MODULE
// =============================================================================
// Error types for the sync pipeline and their HTTP responses.
//
// LAYERS:
// - CatalogSourceError: the remote catalog API misbehaved
// - StoreError:         the datastore rejected a read or write
// - SyncError:          why a reconciliation run stopped
// - AppError:           what an HTTP handler returns
//
// Only AppError knows about status codes.
// =============================================================================

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// =============================================================================
// REMOTE CATALOG ERRORS
// =============================================================================
#[derive(Debug, Error)]
pub enum CatalogSourceError {
    /// Connection refused, TLS failure, request timeout, ...
    #[error("catalog transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The API answered with a non-2xx status
    #[error("catalog API returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The body was not the JSON shape we expect
    #[error("catalog payload could not be decoded: {0}")]
    Decode(String),

    /// Pagination hit the configured page cap before the listing ended
    #[error("catalog listing truncated at the {max_pages}-page cap")]
    Truncated { max_pages: u32 },
}

// =============================================================================
// DATASTORE ERRORS
// =============================================================================
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Raised by non-SQL stores (the in-memory test store)
    #[error("store rejected operation: {0}")]
    Rejected(String),
}

// =============================================================================
// SYNC ERRORS
// =============================================================================
#[derive(Debug, Error)]
pub enum SyncError {
    /// A required credential is absent; raised before any network call
    #[error("missing configuration: {0}")]
    ConfigMissing(&'static str),

    /// The full-catalog fetch exceeded its bound
    #[error("catalog fetch timed out after {0:?}")]
    FetchTimeout(Duration),

    #[error(transparent)]
    Fetch(#[from] CatalogSourceError),

    /// A batch upsert (or a read the run depends on) failed.
    /// Batches committed before the failure are not rolled back.
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    /// Another run holds the job lock
    #[error("a catalog sync is already running")]
    AlreadyRunning,

    #[error("job lock unavailable: {0}")]
    Lock(#[from] redis::RedisError),
}

impl SyncError {
    /// Stable code used in the error body and in metric labels
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::ConfigMissing(_) => "CONFIG_MISSING",
            SyncError::FetchTimeout(_) => "FETCH_TIMEOUT",
            SyncError::Fetch(_) => "FETCH_ERROR",
            SyncError::Persistence(_) => "PERSISTENCE_ERROR",
            SyncError::AlreadyRunning => "SYNC_IN_PROGRESS",
            SyncError::Lock(_) => "LOCK_ERROR",
        }
    }
}

// =============================================================================
// HTTP ERROR TYPE
// =============================================================================
#[derive(Debug, Error)]
pub enum AppError {
    /// Database query failed outside of a sync run
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Reconciliation run failed
    #[error("Sync failed: {0}")]
    Sync(#[from] SyncError),

    /// Product or exclusion record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request data or a disallowed state transition
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => AppError::Database(e),
            StoreError::Rejected(msg) => AppError::Internal(msg),
        }
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
// Handlers return Result<_, AppError>; Axum turns the error into a JSON body.
impl AppError {
    /// Status code this error is answered with
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            // A concurrent run is not a server fault; the caller may retry later
            AppError::Sync(SyncError::AlreadyRunning) => StatusCode::CONFLICT,
            // Config, fetch and persistence failures all surface as 500 so cron
            // callers see a plain failure and retry on their next tick
            AppError::Sync(_) | AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_code, message) = match &self {
            AppError::NotFound(msg) => ("NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => ("BAD_REQUEST", msg.clone()),
            AppError::Sync(err) => (err.code(), err.to_string()),
            // Don't expose SQL details to API callers
            AppError::Database(_) => ("DATABASE_ERROR", "A database error occurred".to_string()),
            AppError::Internal(msg) => ("INTERNAL_ERROR", msg.clone()),
        };

        tracing::error!(
            error_code = error_code,
            message = %message,
            detail = %self,
            "Request failed"
        );

        let body = ErrorResponse::new(error_code, message);

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
