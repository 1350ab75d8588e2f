//! Request identity and ingest-key verification.
//!
//! Authentication belongs to the host dashboard. This service only needs to
//! know who is asking, which the dashboard passes as `X-User-Id`.
//!
//! The save endpoints can be restricted to pollers holding the ingest key.
//! Only the SHA-256 of the key is kept in memory; requests are checked by
//! hashing the presented key and comparing hashes.

use crate::models::UserId;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use ring::digest::{digest, SHA256};
use serde::Serialize;

/// Header carrying the current user's id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Header carrying the ingest key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Hash a token using SHA-256 and return hex-encoded result
pub fn hash_token(token: &str) -> String {
    let hash = digest(&SHA256, token.as_bytes());
    hex::encode(hash.as_ref())
}

/// The user on whose behalf a request is made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or(AuthError::MissingUser)?;

        value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<UserId>().ok())
            .filter(|id| *id > 0)
            .map(CurrentUser)
            .ok_or(AuthError::InvalidUser)
    }
}

/// Ingest key check for the save endpoints
#[derive(Debug, Clone, Default)]
pub struct IngestAuth {
    key_hash: Option<String>,
}

impl IngestAuth {
    /// `None` leaves the save endpoints open.
    pub fn new(key: Option<&str>) -> Self {
        Self {
            key_hash: key.filter(|k| !k.is_empty()).map(hash_token),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key_hash.is_some()
    }

    pub fn verify(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let Some(expected) = &self.key_hash else {
            return Ok(());
        };

        let provided = headers
            .get(API_KEY_HEADER)
            .ok_or(AuthError::MissingKey)?
            .to_str()
            .map_err(|_| AuthError::Unauthorized)?;

        if hash_token(provided) == *expected {
            Ok(())
        } else {
            Err(AuthError::Unauthorized)
        }
    }
}

/// Authorization error
#[derive(Debug)]
pub enum AuthError {
    /// Missing X-User-Id header
    MissingUser,
    /// X-User-Id is not a positive integer
    InvalidUser,
    /// Missing X-API-Key header
    MissingKey,
    /// Key verification failed
    Unauthorized,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AuthError::MissingUser => (
                StatusCode::UNAUTHORIZED,
                "MISSING_USER",
                "X-User-Id header required",
            ),
            AuthError::InvalidUser => (
                StatusCode::BAD_REQUEST,
                "INVALID_USER",
                "X-User-Id must be a positive integer",
            ),
            AuthError::MissingKey => (
                StatusCode::UNAUTHORIZED,
                "MISSING_API_KEY",
                "X-API-Key header required",
            ),
            AuthError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Invalid API key",
            ),
        };

        let body = Json(AuthErrorResponse {
            error: message.to_string(),
            code,
        });

        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    error: String,
    code: &'static str,
}
