//! Authentication errors.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token on the request.
    #[error("missing authorization token")]
    MissingToken,

    /// Invalid authorization header format.
    #[error("invalid authorization header format")]
    InvalidAuthHeader,

    /// Invalid token.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token expired.
    #[error("token expired")]
    TokenExpired,

    /// Token is valid but its user is unknown.
    #[error("user not found")]
    UserNotFound,

    /// Internal error.
    #[error("internal auth error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct AuthErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        // Every credential failure looks the same to the client.
        let (status, code, message) = match &self {
            AuthError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "internal authentication error".to_string(),
            ),
            _ => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "could not validate credentials".to_string(),
            ),
        };
        tracing::debug!(error = %self, "authentication rejected");

        let body = Json(AuthErrorResponse {
            error: message,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_display() {
        let err = AuthError::MissingToken;
        assert_eq!(err.to_string(), "missing authorization token");

        let err = AuthError::InvalidToken("bad".to_string());
        assert_eq!(err.to_string(), "invalid token: bad");
    }

    #[test]
    fn test_auth_error_status_hides_reason() {
        for err in [
            AuthError::MissingToken,
            AuthError::TokenExpired,
            AuthError::UserNotFound,
            AuthError::InvalidToken("signature".to_string()),
        ] {
            assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
        }
        assert_eq!(
            AuthError::Internal("x".to_string()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
