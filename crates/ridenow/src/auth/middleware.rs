//! Token verification and the REST authentication middleware.

use axum::{
    extract::{FromRequestParts, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use log::warn;
use ridenow_protocol::UserId;
use std::sync::Arc;

use super::{AuthConfig, AuthError, Claims};

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if token.is_empty() {
        return Err(AuthError::InvalidAuthHeader);
    }

    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" && !value.is_empty() {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}

/// Find the bearer token on a request.
///
/// Checked in order:
/// 1. `Authorization: Bearer <token>` header
/// 2. `token` query parameter (browsers cannot set headers on WebSocket upgrades)
pub fn request_token(headers: &HeaderMap, query: Option<&str>) -> Result<Option<String>, AuthError> {
    if let Some(header) = headers.get(AUTHORIZATION) {
        let value = header.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
        return bearer_token_from_header(value).map(|t| Some(t.to_string()));
    }
    Ok(query.and_then(token_from_query))
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    decoding_key: Option<DecodingKey>,
}

impl AuthState {
    /// Create new auth state from config.
    /// Resolves `env:VAR_NAME` syntax in jwt_secret at construction time.
    pub fn new(mut config: AuthConfig) -> Self {
        if let Ok(Some(resolved)) = config.resolve_jwt_secret() {
            config.jwt_secret = Some(resolved);
        }

        let decoding_key = config
            .jwt_secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));

        Self {
            config: Arc::new(config),
            decoding_key,
        }
    }

    /// Check if dev mode is enabled.
    pub fn is_dev_mode(&self) -> bool {
        self.config.dev_mode
    }

    /// Get allowed CORS origins from config.
    pub fn allowed_origins(&self) -> &[String] {
        &self.config.allowed_origins
    }

    /// Validate a token and return its claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        if self.config.dev_mode
            && let Some(user_id) = token.strip_prefix("dev:")
        {
            return self.dev_claims(user_id);
        }

        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();
        validation.required_spec_claims.insert("exp".to_string());
        validation.required_spec_claims.insert("sub".to_string());

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        if token_data.claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty subject".to_string()));
        }

        Ok(token_data.claims)
    }

    /// Verify a token and return the identity it was issued for.
    pub fn verify_token(&self, token: &str) -> Result<UserId, AuthError> {
        self.validate_token(token).map(|claims| claims.user_id())
    }

    fn dev_claims(&self, user_id: &str) -> Result<Claims, AuthError> {
        if user_id.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty dev user".to_string()));
        }
        let now = Utc::now().timestamp();
        Ok(Claims {
            sub: user_id.to_string(),
            iss: Some("dev".to_string()),
            exp: now + self.config.token_ttl_secs,
            iat: Some(now),
            email: None,
            name: None,
        })
    }

    /// Mint a token for a user.
    ///
    /// Token issuance belongs to the identity service; this exists for local
    /// tooling and tests that need a token the gateway will accept.
    pub fn generate_token(&self, user_id: &UserId, name: Option<&str>) -> Result<String, AuthError> {
        use jsonwebtoken::{EncodingKey, Header, encode};

        let secret = self
            .config
            .jwt_secret
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            iss: Some("ridenow".to_string()),
            exp: now + self.config.token_ttl_secs,
            iat: Some(now),
            email: None,
            name: name.map(str::to_string),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    /// User claims.
    pub claims: Claims,
}

impl CurrentUser {
    /// Get the user ID.
    pub fn id(&self) -> UserId {
        self.claims.user_id()
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingToken)
    }
}

/// Authentication middleware.
///
/// Validates the bearer token and injects `CurrentUser` into request extensions.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let token = request_token(req.headers(), req.uri().query())?.ok_or(AuthError::MissingToken)?;
    let claims = auth.validate_token(&token)?;

    req.extensions_mut().insert(CurrentUser { claims });

    Ok(next.run(req).await)
}
