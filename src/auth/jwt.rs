//! HS256 tokens signed with a shared secret

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use super::{validation, AuthError, Claims, TokenValidator};
use crate::error::ConfigError;
use crate::storage::CanonicalPath;

const MIN_SECRET_LEN: usize = 8;

pub struct JwtValidator {
    key: DecodingKey,
    // Pinned to HS256; any other `alg` header is rejected
    validation: Validation,
}

impl JwtValidator {
    pub fn new(shared_secret: &[u8]) -> Result<Self, ConfigError> {
        if shared_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::SecretTooShort);
        }

        Ok(Self {
            key: DecodingKey::from_secret(shared_secret),
            validation: validation(Algorithm::HS256),
        })
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<CanonicalPath, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        data.claims.into_path()
    }
}
