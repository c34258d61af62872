//! JWT claims.

use ridenow_protocol::UserId;
use serde::{Deserialize, Serialize};

/// JWT claims structure.
///
/// Only `sub` and `exp` are required; whether a user is a driver comes from the
/// persistence layer, not from the token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,

    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,

    /// Expiration time (as Unix timestamp).
    pub exp: i64,

    /// Issued at (as Unix timestamp).
    #[serde(default)]
    pub iat: Option<i64>,

    /// User's email.
    #[serde(default)]
    pub email: Option<String>,

    /// User's name.
    #[serde(default)]
    pub name: Option<String>,
}

impl Claims {
    /// The identity this token was issued for.
    pub fn user_id(&self) -> UserId {
        UserId::from(self.sub.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_user_id() {
        let claims = Claims {
            sub: "17".to_string(),
            iss: None,
            exp: 0,
            iat: None,
            email: Some("rider@example.com".to_string()),
            name: Some("Ada Rider".to_string()),
        };
        assert_eq!(claims.user_id(), UserId::from("17"));
    }

    #[test]
    fn test_claims_deserialize_minimal() {
        let claims: Claims = serde_json::from_str(r#"{"sub":"3","exp":1}"#).unwrap();
        assert_eq!(claims.sub, "3");
        assert!(claims.name.is_none());
    }
}
