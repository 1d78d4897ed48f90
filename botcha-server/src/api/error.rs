//! Mapping of [`BotchaError`] onto HTTP responses.

use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use botcha::BotchaError;
use serde::Serialize;
use tracing::error;

/// Error body: `{"success": false, "error": "<kind>", "message": "..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Always `false`.
    pub success: bool,
    /// Stable machine-readable code.
    pub error: &'static str,
    /// Human-readable detail.
    pub message: String,
}

/// Handler error.
#[derive(Debug)]
pub enum ApiError {
    /// A core operation failed.
    Botcha(BotchaError),
    /// The request body or query did not deserialize.
    BadRequest(String),
}

impl From<BotchaError> for ApiError {
    fn from(error: BotchaError) -> Self {
        Self::Botcha(error)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// Status for a core error. Security and verification failures are 403 since
/// resending the same credentials cannot succeed.
#[must_use]
pub fn status_for(error: &BotchaError) -> StatusCode {
    match error {
        BotchaError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        BotchaError::InvalidInput(_)
        | BotchaError::InvalidAnswerFormat(_)
        | BotchaError::InvalidSignatureInput(_)
        | BotchaError::InvalidDirectoryUrl(_)
        | BotchaError::UnsupportedAlgorithm(_)
        | BotchaError::CryptoError(_) => StatusCode::BAD_REQUEST,
        BotchaError::AgentNotFound | BotchaError::SessionNotFound => StatusCode::NOT_FOUND,
        e if e.is_infrastructure() => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::FORBIDDEN,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody { success: false, error: "bad_request", message }),
            )
                .into_response(),
            Self::Botcha(err) => {
                let status = status_for(&err);
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(error = %err, "request failed");
                    "internal server error".to_owned()
                } else {
                    err.to_string()
                };

                let mut response =
                    (status, Json(ErrorBody { success: false, error: err.kind(), message }))
                        .into_response();
                if let BotchaError::RateLimited { retry_after } = err {
                    response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(retry_after));
                }
                response
            }
        }
    }
}
