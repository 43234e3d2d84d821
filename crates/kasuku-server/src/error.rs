//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kasuku_core::{ClassifiedError, ErrorCode};
use serde_json::json;

/// API error type
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<ErrorCode>,
    pub suggestions: Vec<String>,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::plain(StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::plain(StatusCode::NOT_FOUND, msg)
    }

    fn plain(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            code: None,
            suggestions: Vec::new(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "code": self.code,
                "suggestions": self.suggestions,
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<ClassifiedError> for ApiError {
    fn from(err: ClassifiedError) -> Self {
        let status = match err.code {
            ErrorCode::NotReady | ErrorCode::AlreadyGenerating => StatusCode::CONFLICT,
            ErrorCode::ModelLoadError => StatusCode::CONFLICT,
            ErrorCode::TimeoutError => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::NetworkError => StatusCode::BAD_GATEWAY,
            ErrorCode::PermissionError => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.user_message,
            code: Some(err.code),
            suggestions: err.suggestions,
        }
    }
}
