// crates/server/src/error.rs
//! API error mapping: every failure renders as `{error: {code, message}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pi_brain_db::StoreError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn code(&self) -> (&'static str, StatusCode) {
        match self {
            ApiError::NotFound(_) => ("not_found", StatusCode::NOT_FOUND),
            ApiError::BadRequest(_) => ("bad_request", StatusCode::BAD_REQUEST),
            ApiError::Internal(_) => ("internal", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (code, status) = self.code();
        (
            status,
            Json(json!({ "error": { "code": code, "message": message } })),
        )
            .into_response()
    }
}

/// Wrap a payload in the success envelope `{data, durationMs}`.
pub fn envelope<T: serde::Serialize>(data: T, started: std::time::Instant) -> Json<serde_json::Value> {
    Json(json!({
        "data": data,
        "durationMs": started.elapsed().as_millis() as u64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let (code, status) = ApiError::NotFound("x".to_string()).code();
        assert_eq!(code, "not_found");
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (code, status) = ApiError::BadRequest("x".to_string()).code();
        assert_eq!(code, "bad_request");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_store_error_mapping() {
        let err: ApiError = StoreError::NotFound("node abc".to_string()).into();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn test_envelope_shape() {
        let json = envelope(serde_json::json!({"x": 1}), std::time::Instant::now());
        assert_eq!(json.0["data"]["x"], 1);
        assert!(json.0["durationMs"].is_u64());
    }
}
