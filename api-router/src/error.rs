use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

pub const INDEX_NOT_READY: &str = "INDEX_NOT_READY";
pub const INDEX_FAILED: &str = "INDEX_FAILED";
pub const NO_GROUNDING: &str = "NO_GROUNDING";

#[derive(Error, Debug, Serialize, Clone)]
pub enum ApiError {
    #[error("Internal server error")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Usage limit: {message}")]
    UsageLimit { code: &'static str, message: String },

    #[error("Conflict: {message}")]
    Conflict { code: &'static str, message: String },

    #[error("Unprocessable: {message}")]
    Unprocessable { code: &'static str, message: String },
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound(msg) => Self::NotFound(msg),
            AppError::Validation(msg) => Self::ValidationError(msg),
            AppError::Auth(msg) => Self::Unauthorized(msg),
            AppError::UsageLimit { code, message } => Self::UsageLimit { code, message },
            AppError::IndexNotReady(id) => Self::Conflict {
                code: INDEX_NOT_READY,
                message: format!("{id} is still being indexed"),
            },
            AppError::IndexFailed(id) => Self::Conflict {
                code: INDEX_FAILED,
                message: format!("indexing {id} failed; retry the document"),
            },
            AppError::NoGrounding(msg) => Self::Unprocessable {
                code: NO_GROUNDING,
                message: msg,
            },
            AppError::UnsupportedFormat(msg) => Self::Unprocessable {
                code: "UNSUPPORTED_FORMAT",
                message: msg,
            },
            other => {
                tracing::error!(error = %other, code = other.code(), "Internal error");
                Self::InternalError("Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, error) = match self {
            Self::InternalError(message) => (StatusCode::INTERNAL_SERVER_ERROR, None, message),
            Self::ValidationError(message) => (StatusCode::BAD_REQUEST, None, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, None, message),
            Self::Unauthorized(message) => (StatusCode::UNAUTHORIZED, None, message),
            Self::PayloadTooLarge(message) => (StatusCode::PAYLOAD_TOO_LARGE, None, message),
            Self::UsageLimit { code, message } => (StatusCode::FORBIDDEN, Some(code), message),
            Self::Conflict { code, message } => (StatusCode::CONFLICT, Some(code), message),
            Self::Unprocessable { code, message } => {
                (StatusCode::UNPROCESSABLE_ENTITY, Some(code), message)
            }
        };

        let body = ErrorResponse {
            error,
            status: "error".to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    error: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}
