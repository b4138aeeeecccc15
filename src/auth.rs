//! Token Validation
//!
//! The hub authenticates connections through [`TokenValidator`]. The bundled
//! [`JwtValidator`] accepts HS256 tokens whose `sub` claim is the account ID.

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authenticated account behind a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Account ID; providers and receivers only pair within one account
    pub user_id: String,
}

/// Token validation failures
///
/// The display text is what the client sees in its `error` envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Token has expired")]
    Expired,

    #[error("Token not valid yet")]
    NotYetValid,

    #[error("Token is malformed")]
    Malformed,

    #[error("Token signature is invalid")]
    InvalidSignature,

    #[error("Token is invalid")]
    Invalid(String),

    #[error("UserID missing or invalid in token")]
    MissingSubject,
}

impl AuthError {
    /// Low-cardinality label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Expired => "expired",
            AuthError::NotYetValid => "not_yet_valid",
            AuthError::Malformed => "malformed",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::Invalid(_) => "invalid",
            AuthError::MissingSubject => "missing_subject",
        }
    }
}

/// Validates bearer tokens presented in `client_auth`
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Claims read from relay tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: String,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
}

/// HS256 JWT validator with a shared secret
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::ImmatureSignature => AuthError::NotYetValid,
                ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                    AuthError::Malformed
                }
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::Invalid(e.to_string()),
            })?;

        let user_id = data.claims.sub.trim();
        if user_id.is_empty() {
            return Err(AuthError::MissingSubject);
        }
        Ok(Identity {
            user_id: user_id.to_string(),
        })
    }
}
