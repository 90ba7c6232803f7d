use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::response::ErrorResponse;

pub type Result<T> = std::result::Result<T, CounterError>;

/// Errors raised by the counter store and the query service.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("No tweet filter")]
    MissingFilter,

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for CounterError {
    fn from(err: redis::RedisError) -> Self {
        CounterError::Redis(err.to_string())
    }
}

/// Errors surfaced to HTTP callers. Always rendered as a JSON body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid result count '{0}'")]
    InvalidCount(String),

    #[error("Invalid query string: {0}")]
    InvalidQuery(String),

    #[error("Not found")]
    NotFound,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error(transparent)]
    Counter(#[from] CounterError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidCount(_) | ApiError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Counter(CounterError::MissingFilter) => StatusCode::BAD_REQUEST,
            ApiError::Counter(CounterError::Redis(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Counter(CounterError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> String {
        match self {
            ApiError::InvalidCount(_) => "Invalid result count".to_string(),
            ApiError::InvalidQuery(_) => "Invalid query string".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "rejected request");
        }

        (status, Json(ErrorResponse::new(self.reason()))).into_response()
    }
}
