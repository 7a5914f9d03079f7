//! Error responses

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use outpost_common::{Error, ErrorKind};
use serde::Serialize;

/// Body of every failed request
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Wraps a library error so handlers can return it with `?`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(code = %self.0.code(), "Request failed: {}", self.0);
        } else {
            tracing::debug!(code = %self.0.code(), "Request rejected: {}", self.0);
        }

        let body = ErrorResponse {
            error: self.0.code(),
            kind: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Give body-limit rejections the same envelope as every other error
pub async fn structured_payload_too_large(response: Response, limit: usize) -> Response {
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));
    if response.status() != StatusCode::PAYLOAD_TOO_LARGE || is_json {
        return response;
    }

    tracing::debug!(limit, "Request body over limit");
    let body = ErrorResponse {
        error: "PayloadTooLarge".into(),
        kind: ErrorKind::Validation,
        message: format!("Request body exceeds {} bytes", limit),
    };
    (StatusCode::PAYLOAD_TOO_LARGE, Json(body)).into_response()
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
