use axum::{http::StatusCode, response::IntoResponse, Json};

use super::{metrics::record_auth_failure, types::ErrorBody};

/// Failure taxonomy shared by the gateway and the fallback HTTP path. The
/// HTTP translation lives in exactly one place (`IntoResponse` below); the
/// gateway maps the same values to scoped `error` events instead of tearing
/// down the connection.
#[derive(Debug, PartialEq, Eq)]
pub enum ServiceError {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    TransientStorage,
    Internal,
}

impl ServiceError {
    /// Human-readable text for gateway `error` events.
    pub(crate) fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid request",
            Self::Unauthorized => "invalid credentials",
            Self::Forbidden => "not a participant of this conversation",
            Self::NotFound => "not found",
            Self::TransientStorage => "temporary storage failure, retry",
            Self::Internal => "internal error",
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<weft_core::DomainError> for ServiceError {
    fn from(_: weft_core::DomainError) -> Self {
        Self::InvalidRequest
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Unauthorized => record_auth_failure("unauthorized"),
            Self::Forbidden => record_auth_failure("forbidden"),
            Self::InvalidRequest | Self::NotFound | Self::TransientStorage | Self::Internal => {}
        }

        match self {
            Self::InvalidRequest => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "invalid_request",
                }),
            )
                .into_response(),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: "invalid_credentials",
                }),
            )
                .into_response(),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(ErrorBody { error: "forbidden" }),
            )
                .into_response(),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody { error: "not_found" }),
            )
                .into_response(),
            Self::TransientStorage => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody {
                    error: "storage_unavailable",
                }),
            )
                .into_response(),
            Self::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "internal_error",
                }),
            )
                .into_response(),
        }
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(true)
        .init();
}
