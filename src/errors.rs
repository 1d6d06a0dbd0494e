use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateways::GatewayError;

/// Error body returned to HTTP callers
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Whether the caller should fix input, retry, or give up
    pub class: ErrorClass,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

/// How a caller is expected to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Fix the input and resubmit.
    Correctable,
    /// Retry the same request later.
    Transient,
    /// Retrying will not help.
    Terminal,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Verification attempts exhausted for order {0}")]
    AttemptsExhausted(Uuid),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        ServiceError::ExternalServiceError(err.to_string())
    }
}

impl ServiceError {
    /// Shorthand for a field-level validation failure.
    pub fn invalid(field: &str, message: impl std::fmt::Display) -> Self {
        ServiceError::ValidationError(format!("{}: {}", field, message))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ValidationError(_) | Self::NotFound(_) => ErrorClass::Correctable,
            Self::DatabaseError(_)
            | Self::ConcurrentModification(_)
            | Self::ExternalServiceError(_)
            | Self::InternalError(_) => ErrorClass::Transient,
            Self::Forbidden(_) | Self::StateConflict(_) | Self::AttemptsExhausted(_) => {
                ErrorClass::Terminal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::StateConflict(_) | Self::ConcurrentModification(_) => StatusCode::CONFLICT,
            Self::AttemptsExhausted(_) => StatusCode::LOCKED,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            Self::ExternalServiceError(_) => {
                "Payment provider is unavailable, please try again".to_string()
            }
            Self::ConcurrentModification(id) => {
                format!("Order {} was modified concurrently, please retry", id)
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            class: self.class(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}
