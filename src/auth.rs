//! Bearer-token authentication for the WebSocket handshake.
//!
//! The gateway only needs one question answered before upgrading a socket:
//! which user does this token belong to? [`Authenticator`] is that seam.
//! [`JwtAuthenticator`] answers it with HS256 tokens carrying a `user_id`
//! claim, and can also mint tokens for the development token endpoint.

use std::fmt;

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::domain::UserId;
use crate::error::GatewayError;

/// Verifies bearer credentials presented at handshake time.
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Resolves a token to the user it was issued for.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unauthorized`] for a missing, malformed,
    /// expired, or foreign token.
    fn verify(&self, token: &str) -> Result<UserId, GatewayError>;
}

/// JWT claims issued by the user service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated user id.
    pub user_id: i64,
    /// Display name at issue time.
    #[serde(default)]
    pub username: String,
    /// Expiry (Unix seconds).
    pub exp: i64,
    /// Issued-at (Unix seconds).
    pub iat: i64,
    /// Not-before (Unix seconds).
    pub nbf: i64,
    /// Issuer.
    pub iss: String,
}

/// HS256 token verifier and issuer.
pub struct JwtAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    ttl: Duration,
}

impl JwtAuthenticator {
    /// Creates an authenticator sharing `secret` with the user service.
    ///
    /// Only tokens whose `iss` equals `issuer` verify, so `issuer` must match
    /// whatever the user service signs with.
    #[must_use]
    pub fn new(secret: &str, issuer: impl Into<String>, ttl: Duration) -> Self {
        let issuer = issuer.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer.as_str()]);
        validation.validate_nbf = true;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer,
            ttl,
        }
    }

    /// Issues a token for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if signing fails.
    pub fn issue(&self, user_id: UserId, username: &str) -> Result<String, GatewayError> {
        let now = Utc::now();
        let claims = Claims {
            user_id: user_id.get(),
            username: username.to_string(),
            exp: (now + self.ttl).timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            iss: self.issuer.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| GatewayError::Internal(format!("failed to sign token: {e}")))
    }
}

impl fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("issuer", &self.issuer)
            .field("ttl_secs", &self.ttl.num_seconds())
            .finish_non_exhaustive()
    }
}

impl Authenticator for JwtAuthenticator {
    fn verify(&self, token: &str) -> Result<UserId, GatewayError> {
        if token.trim().is_empty() {
            return Err(GatewayError::Unauthorized("token required".to_string()));
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => {
                    GatewayError::Unauthorized("token has expired".to_string())
                }
                _ => GatewayError::Unauthorized("invalid token".to_string()),
            })?;
        let user_id = UserId::new(data.claims.user_id);
        if !user_id.is_set() {
            return Err(GatewayError::Unauthorized("invalid token".to_string()));
        }
        Ok(user_id)
    }
}
