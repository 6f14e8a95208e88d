//! JSON error responses for the HTTP API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::calibration::CalibrationError;
use crate::calibration::store::StoreError;
use crate::hub::HubError;
use crate::protocol::ErrorCode;

/// Rendered as `{"code": "...", "message": "...", "retryable": bool}` with `status`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    fn new(status: StatusCode, err: &impl ErrorCode) -> Self {
        Self { status, code: err.error_code(), message: err.to_string(), retryable: err.retryable() }
    }

    pub fn store_unavailable() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "E_CALIBRATION_STORE_UNAVAILABLE",
            message: "calibration store is unavailable".into(),
            retryable: false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "code": self.code, "message": self.message, "retryable": self.retryable });
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Corrupt { .. } | StoreError::Io(_) | StoreError::Encode(_) => {
                warn!(error = %err, code = err.error_code(), "calibration store operation failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, &err)
    }
}

impl From<CalibrationError> for ApiError {
    fn from(err: CalibrationError) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, &err)
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        let status = match err {
            HubError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            HubError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, &err)
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
