//! REST error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::auth::AuthError;
use crate::rides::RideError;

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        let message = match &self {
            ApiError::Internal(msg) => {
                error!(error_code = code, message = %msg, "API error");
                "Internal server error".to_string()
            }
            ApiError::ServiceUnavailable(msg) => {
                warn!(error_code = code, message = %msg, "Service unavailable");
                self.to_string()
            }
            _ => {
                debug!(error_code = code, message = %self, "Client error");
                self.to_string()
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code,
            }),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

impl From<RideError> for ApiError {
    fn from(err: RideError) -> Self {
        match err {
            RideError::NotFound(_) => ApiError::NotFound(err.to_string()),
            RideError::Forbidden(_) | RideError::NotRideDriver => {
                ApiError::Forbidden(err.to_string())
            }
            RideError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            RideError::Validation(msg) => ApiError::BadRequest(msg.to_string()),
            RideError::Internal(inner) => ApiError::Internal(format!("{inner:#}")),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Internal(msg) => ApiError::Internal(format!("Authentication error: {msg}")),
            AuthError::UserNotFound => ApiError::Unauthorized("User not found".to_string()),
            _ => ApiError::Unauthorized("Could not validate credentials".to_string()),
        }
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ridenow_protocol::{RideId, RideStatus};

    #[test]
    fn test_ride_error_mapping() {
        assert!(matches!(
            ApiError::from(RideError::NotFound(RideId::new(1))),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(RideError::NotRideDriver),
            ApiError::Forbidden(_)
        ));
        assert!(matches!(
            ApiError::from(RideError::InvalidTransition {
                from: RideStatus::Completed,
                to: RideStatus::Cancelled,
            }),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            ApiError::from(RideError::Validation("pickup and dropoff are required")),
            ApiError::BadRequest(_)
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::not_found("x").into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(AuthError::TokenExpired).into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(anyhow::anyhow!("db gone")).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
