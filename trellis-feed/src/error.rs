//! HTTP Error Responses
//!
//! `ApiError` is what the HTTP surface returns before a connection is
//! upgraded. It carries the stable error code of the underlying
//! `TrellisError` and serializes as JSON with a matching status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use trellis_core::{ErrorCode, TrellisError};

/// Result type for HTTP handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable error code, e.g. `INVALID_PARAMETER` or `UNAUTHORIZED`
    pub code: String,

    /// Human-readable error message
    pub message: String,

    #[serde(skip, default = "internal_status")]
    status: StatusCode,
}

fn internal_status() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// HTTP status for each trellis error code.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::RecordNotFound | ErrorCode::NoReleaseMatched => StatusCode::NOT_FOUND,
        ErrorCode::InvalidParameter => StatusCode::BAD_REQUEST,
        ErrorCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Inconsistent | ErrorCode::Unavailable | ErrorCode::Cancelled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorCode::Aborted | ErrorCode::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<TrellisError> for ApiError {
    fn from(error: TrellisError) -> Self {
        let code = error.code();
        Self::new(status_for(code), code.as_str(), error.to_string())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = %self.code, message = %self.message, "Request failed");
        }
        (self.status, Json(self)).into_response()
    }
}
