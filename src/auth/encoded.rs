//! Open access: the token is the base64url-encoded path

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use super::{AuthError, TokenValidator};
use crate::storage::CanonicalPath;

#[derive(Debug, Default, Clone, Copy)]
pub struct EncodedValidator;

impl EncodedValidator {
    pub fn new() -> Self {
        Self
    }
}

impl TokenValidator for EncodedValidator {
    fn validate(&self, token: &str) -> Result<CanonicalPath, AuthError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| AuthError::InvalidEncoding(e.to_string()))?;
        Ok(CanonicalPath::new(bytes))
    }
}
