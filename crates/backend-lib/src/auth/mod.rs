// ============================
// chathub-backend-lib/src/auth/mod.rs
// ============================
//! Authentication module.
//!
//! The hub only needs one thing from authentication: turn a bearer credential
//! into a stable user id. Token issuance lives outside this crate.

mod jwt;

pub use jwt::{Claims, JwtAuthenticator};

use crate::error::AppError;
use crate::AppState;
use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use chathub_common::UserId;
use std::sync::Arc;
use thiserror::Error;

/// Name of the cookie carrying the bearer token
pub const AUTH_COOKIE: &str = "jwt";

/// Authentication failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credential provided")]
    MissingCredential,

    #[error("credential expired")]
    Expired,

    #[error("invalid credential: {0}")]
    Invalid(String),
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::Auth(err.to_string())
    }
}

/// Resolves a bearer credential to the user id the hub routes on
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// Find the bearer credential of a request.
///
/// Looks at the `jwt` cookie first, then `Authorization: Bearer`, then a
/// `token` query parameter (browsers cannot set headers on WebSocket upgrades).
pub fn extract_credential(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == AUTH_COOKIE)
        .map(|(_, value)| value.to_string());

    let from_header = || {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
    };

    let from_query = || {
        query?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| *name == "token")
            .map(|(_, value)| value.to_string())
    };

    from_cookie
        .or_else(from_header)
        .or_else(from_query)
        .filter(|token| !token.is_empty())
}

/// Extractor for HTTP handlers that require an authenticated user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let credential = extract_credential(&parts.headers, parts.uri.query())
            .ok_or(AuthError::MissingCredential)?;
        let user_id = state.auth.authenticate(&credential).await?;
        Ok(AuthUser(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_cookie_wins_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; jwt=cookie-token"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));
        assert_eq!(
            extract_credential(&headers, Some("token=query-token")).as_deref(),
            Some("cookie-token")
        );
    }

    #[test]
    fn test_header_then_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));
        assert_eq!(
            extract_credential(&headers, None).as_deref(),
            Some("header-token")
        );

        let headers = HeaderMap::new();
        assert_eq!(
            extract_credential(&headers, Some("a=1&token=query-token")).as_deref(),
            Some("query-token")
        );
        assert_eq!(extract_credential(&headers, Some("token=")), None);
        assert_eq!(extract_credential(&headers, None), None);
    }
}
