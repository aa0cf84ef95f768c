//! API token generation and verification
//!
//! Tokens are `ad_` followed by 32 random bytes in URL-safe Base64. Only an
//! Argon2id hash is persisted; the raw value is shown once at creation.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};

use crate::error::AuthError;

/// Prefix of every API token issued by this server
pub const TOKEN_PREFIX: &str = "ad_";

const TOKEN_RANDOM_BYTES: usize = 32;
const TOKEN_ID_BYTES: usize = 16;

/// A freshly minted token
#[derive(Debug, Clone)]
pub struct GeneratedToken {
    /// Value handed to the user
    pub raw: String,
    /// Row identifier
    pub id: String,
}

/// Generate a new API token and its identifier
///
/// ```
/// use artifact_depot::auth::token::generate_token;
///
/// let token = generate_token();
/// assert!(token.raw.starts_with("ad_"));
/// ```
pub fn generate_token() -> GeneratedToken {
    GeneratedToken {
        raw: format!("{}{}", TOKEN_PREFIX, random_b64(TOKEN_RANDOM_BYTES)),
        id: random_b64(TOKEN_ID_BYTES),
    }
}

/// Random bytes in URL-safe Base64 without padding
pub fn random_b64(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hash a secret (token or password) with Argon2id in PHC format
pub fn hash_token(secret: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Signing(format!("hash failed: {}", e)))
}

/// Check a secret against a stored PHC hash; malformed hashes never match
pub fn verify_token(secret: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Whether a string looks like one of our API tokens
pub fn is_valid_token_format(token: &str) -> bool {
    match token.strip_prefix(TOKEN_PREFIX) {
        Some(body) if !body.is_empty() => URL_SAFE_NO_PAD.decode(body).is_ok(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: generated tokens carry the prefix and 32 random bytes
    #[test]
    fn test_generate_token_shape() {
        let token = generate_token();
        let body = token.raw.strip_prefix(TOKEN_PREFIX).unwrap();
        assert_eq!(URL_SAFE_NO_PAD.decode(body).unwrap().len(), TOKEN_RANDOM_BYTES);
        assert_eq!(URL_SAFE_NO_PAD.decode(&token.id).unwrap().len(), TOKEN_ID_BYTES);
    }

    // Test 2: tokens and ids are unique
    #[test]
    fn test_generate_token_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a.raw, b.raw);
        assert_ne!(a.id, b.id);
    }

    // Test 3: hashing is salted Argon2id
    #[test]
    fn test_hash_token_salted() {
        let h1 = hash_token("ad_value").unwrap();
        let h2 = hash_token("ad_value").unwrap();
        assert!(h1.starts_with("$argon2id$"));
        assert_ne!(h1, h2);
    }

    // Test 4: verify accepts the right secret only
    #[test]
    fn test_verify_token() {
        let token = generate_token();
        let hash = hash_token(&token.raw).unwrap();
        assert!(verify_token(&token.raw, &hash));
        assert!(!verify_token("ad_other", &hash));
        assert!(!verify_token(&token.raw, "not-a-phc-string"));
    }

    // Test 5: format checks
    #[test]
    fn test_token_format() {
        assert!(is_valid_token_format(&generate_token().raw));
        assert!(!is_valid_token_format("rf_abc"));
        assert!(!is_valid_token_format("ad_"));
        assert!(!is_valid_token_format("ad_!!!"));
    }
}
