//! Content digests
//!
//! SHA-256 digests identify blobs and manifests (`sha256:<hex>`) and are the
//! `content_hash` of every artifact. SHA-1 and SHA-512 are only produced for
//! ecosystems whose tooling checks them.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::ParseError;

/// Algorithm prefix used on the wire
pub const SHA256_PREFIX: &str = "sha256:";

/// A SHA-256 content digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Compute the digest of a byte slice
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Create an incremental hasher
    pub fn hasher() -> DigestHasher {
        DigestHasher(Sha256::new())
    }

    /// Lowercase hex without prefix
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a bare 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        let bytes = hex::decode(s)
            .map_err(|e| ParseError::InvalidVersion(format!("invalid digest hex: {}", e)))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            ParseError::InvalidVersion(format!("digest must be 32 bytes, got '{}'", s))
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SHA256_PREFIX, self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", &self.to_hex()[..16])
    }
}

impl FromStr for ContentDigest {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s.strip_prefix(SHA256_PREFIX).ok_or_else(|| {
            ParseError::InvalidVersion(format!("unsupported digest algorithm in '{}'", s))
        })?;
        Self::from_hex(hex_part)
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.to_string()
    }
}

/// Incremental SHA-256 hasher
#[derive(Clone)]
pub struct DigestHasher(Sha256);

impl DigestHasher {
    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Digest of everything fed so far
    pub fn finalize(self) -> ContentDigest {
        ContentDigest(self.0.finalize().into())
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        ContentDigest::hasher()
    }
}

/// Whether a reference looks like a digest rather than a tag
pub fn is_digest_reference(reference: &str) -> bool {
    reference.contains(':')
}

/// Hex SHA-1, used by npm `shasum`, Composer and Maven checksum files
pub fn sha1_hex(data: &[u8]) -> String {
    use sha1::Sha1;
    hex::encode(Sha1::digest(data))
}

/// Subresource-integrity SHA-512, used by npm `integrity`
pub fn sha512_integrity(data: &[u8]) -> String {
    format!("sha512-{}", STANDARD.encode(Sha512::digest(data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Known SHA-256 vector
    #[test]
    fn test_compute_known_vector() {
        let digest = ContentDigest::compute(b"hello world");
        assert_eq!(
            digest.to_string(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    // Test 2: Parsing rejects other algorithms and bad lengths
    #[test]
    fn test_parse_digest() {
        let parsed: ContentDigest =
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
                .parse()
                .unwrap();
        assert_eq!(parsed, ContentDigest::compute(b"hello world"));

        assert!("sha512:abcd".parse::<ContentDigest>().is_err());
        assert!("sha256:abcd".parse::<ContentDigest>().is_err());
        assert!("b94d27b9".parse::<ContentDigest>().is_err());
    }

    // Test 3: Incremental hashing equals one-shot hashing
    #[test]
    fn test_incremental_hasher() {
        let mut hasher = ContentDigest::hasher();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), ContentDigest::compute(b"hello world"));
    }

    // Test 4: Secondary checksums
    #[test]
    fn test_secondary_checksums() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert!(sha512_integrity(b"abc").starts_with("sha512-3a81oZNherrMQXNJriBBMRLm+k6JqX6iCp7u5ktV05ohkpkqJ"));
    }

    // Test 5: Tag and digest references
    #[test]
    fn test_is_digest_reference() {
        assert!(is_digest_reference("sha256:abc"));
        assert!(!is_digest_reference("latest"));
        assert!(!is_digest_reference("1.2.3"));
    }
}
