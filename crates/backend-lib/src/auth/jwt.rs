use super::{AuthError, Authenticator};
use async_trait::async_trait;
use chathub_common::UserId;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by an access token.
/// `user_id` is what the login endpoint puts in; `sub` is accepted as a fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// HS256 token verifier
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(credential, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        data.claims
            .user_id
            .or(data.claims.sub)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AuthError::Invalid("missing user_id claim".to_string()))
    }
}
