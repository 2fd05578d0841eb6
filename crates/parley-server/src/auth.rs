//! Access token verification.
//!
//! Tokens are HS256 JWTs issued by the external auth service with the claim
//! set `{ id, iat, exp }`. Verification is stateless and never retries; an
//! expired token is rejected exactly at `exp`, with no leeway.

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use parley_shared::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub id: Uuid,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("token expired")]
    Expired,

    #[error("token invalid")]
    Invalid,

    #[error("token could not be signed")]
    Signing,
}

/// Turns a bearer token into a [`UserId`] or rejects it.
#[derive(Clone)]
pub struct IdentityVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl IdentityVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            }
        })?;

        Ok(UserId(data.claims.id))
    }

    /// Mint a token for `user` valid for `ttl`.
    ///
    /// Production tokens come from the auth service; this exists for local
    /// tooling and tests sharing the same secret.
    pub fn issue(&self, user: UserId, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            id: user.0,
            iat: now,
            exp: now + ttl.num_seconds(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| AuthError::Signing)
    }
}
