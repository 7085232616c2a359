//! Mapping of engine errors to HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cinder_core::Error;
use serde_json::json;
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    /// Pipeline rejected by the trust policy.
    Unprocessable(String),
    Timeout(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::Config(_) | Error::InvalidInput(_) | Error::Serialization(_) => {
                ApiError::BadRequest(message)
            }
            Error::Policy(_) => ApiError::Unprocessable(message),
            Error::NotFound(_) => ApiError::NotFound(message),
            Error::Unauthorized(_) => ApiError::Unauthorized(message),
            Error::Conflict(_) => ApiError::Conflict(message),
            Error::Cancelled(_) => ApiError::Timeout(message),
            Error::TransientStore(_) | Error::QueueTimeout(_) | Error::Internal(_) => {
                ApiError::Internal(message)
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
