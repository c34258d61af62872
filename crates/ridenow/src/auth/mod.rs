//! Authentication module.
//!
//! Provides token verification for the gateway and REST API:
//! - HS256 JWT validation (production)
//! - Dev bypass mode accepting `dev:<user_id>` tokens

mod claims;
mod config;
mod error;
mod middleware;

pub use claims::Claims;
pub use config::{AuthConfig, ConfigValidationError};
pub use error::AuthError;
pub use middleware::{AuthState, CurrentUser, auth_middleware, request_token};
