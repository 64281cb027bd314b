//! Token validation
//!
//! A client addresses a publication with an opaque token in the URL. Exactly one
//! [`TokenValidator`] is active per process, chosen by configuration:
//!
//! - `base64`: the token is the unpadded base64url encoding of the path
//! - `jwt`: an HS256 token signed with a shared secret, path in `sub`
//! - `jwks`: a token verified against a remote JSON Web Key Set, path in `sub`

mod encoded;
mod jwks;
mod jwt;

use std::sync::Arc;

use axum::http::StatusCode;
use jsonwebtoken::errors::ErrorKind;
use rand::RngCore;
use serde::Deserialize;
use thiserror::Error;

use crate::client::SafeFetchClient;
use crate::config::{AccessMode, Config};
use crate::error::ConfigError;
use crate::storage::CanonicalPath;

pub use encoded::EncodedValidator;
pub use jwks::{JwksValidator, JWKS_REFRESH_INTERVAL};
pub use jwt::JwtValidator;

/// Turns a client token into the canonical path it grants access to
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<CanonicalPath, AuthError>;
}

/// Token rejection, carrying the HTTP status it maps to
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid base64url path: {0}")]
    InvalidEncoding(String),

    #[error("token is malformed: {0}")]
    Malformed(String),

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("JWT subject is empty")]
    EmptySubject,

    #[error("token has expired")]
    Expired,

    #[error("token validation failed: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Expired => StatusCode::GONE,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName => AuthError::InvalidSignature,
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => AuthError::Malformed(err.to_string()),
            _ => AuthError::Internal(err.to_string()),
        }
    }
}

/// The only claim we read. Time-based claims are checked by `jsonwebtoken`.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
}

impl Claims {
    fn into_path(self) -> Result<CanonicalPath, AuthError> {
        match self.sub {
            Some(sub) if !sub.is_empty() => Ok(CanonicalPath::new(sub)),
            _ => Err(AuthError::EmptySubject),
        }
    }
}

/// Validation rules shared by both signed-token modes
fn validation(algorithm: jsonwebtoken::Algorithm) -> jsonwebtoken::Validation {
    let mut validation = jsonwebtoken::Validation::new(algorithm);
    validation.leeway = 0;
    validation.validate_nbf = true;
    validation.validate_aud = false;
    // `exp` is honoured when present but not required
    validation.required_spec_claims.clear();
    validation
}

/// Build the validator for the configured access mode
pub async fn from_config(
    config: &Config,
    client: Option<&SafeFetchClient>,
) -> Result<Arc<dyn TokenValidator>, ConfigError> {
    match &config.auth.mode {
        AccessMode::Base64 => {
            tracing::info!("Operating in open access mode with base64url encoding (insecure)");
            Ok(Arc::new(EncodedValidator::new()))
        }
        AccessMode::Jwt => {
            let secret = match &config.auth.jwt_shared_secret {
                Some(hex_secret) => {
                    tracing::info!(secret = "<WEBPUB_JWT_SHARED_SECRET>", "Operating in HS256 JWT access mode");
                    hex::decode(hex_secret)?
                }
                None => {
                    let mut secret = [0u8; 32];
                    rand::thread_rng().fill_bytes(&mut secret);
                    tracing::info!(secret = %hex::encode(secret), "Operating in HS256 JWT access mode");
                    secret.to_vec()
                }
            };
            Ok(Arc::new(JwtValidator::new(&secret)?))
        }
        AccessMode::Jwks => {
            let url = config
                .auth
                .jwks_url
                .as_deref()
                .ok_or(ConfigError::MissingJwksUrl)?;
            let client = client.ok_or(ConfigError::JwksWithoutClient)?;
            tracing::info!(jwks_url = %url, "Operating in JWKS JWT access mode");
            Ok(Arc::new(JwksValidator::new(client.clone(), url).await?))
        }
    }
}
