//! Application error types for artifact-depot
//!
//! Each layer has its own error enum. Everything that crosses the
//! repository router boundary is converted into [`RegistryError`], the
//! taxonomy callers and HTTP handlers reason about.

use thiserror::Error;

/// Error taxonomy surfaced by the repository router and container listeners
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    /// Repository, package or version absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate version without redeploy, or a listener port already claimed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Upstream could not be reached and no cached copy was available
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Uploaded bytes do not hash to the asserted digest
    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch {
        /// Digest asserted by the client
        expected: String,
        /// Digest of the bytes actually received
        actual: String,
    },

    /// Missing or invalid credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not permitted
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Write sent to a repository that cannot accept it
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// Malformed request or configuration
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Operation not supported by the plugin
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// HTTP status code conventionally associated with this error
    pub fn status_code(&self) -> u16 {
        match self {
            RegistryError::NotFound(_) => 404,
            RegistryError::Conflict(_) => 409,
            RegistryError::UpstreamUnavailable(_) => 502,
            RegistryError::DigestMismatch { .. } => 400,
            RegistryError::Unauthorized(_) => 401,
            RegistryError::Forbidden(_) => 403,
            RegistryError::WriteRejected(_) => 405,
            RegistryError::InvalidRequest(_) => 400,
            RegistryError::Unsupported(_) => 501,
            RegistryError::Internal(_) => 500,
        }
    }

    /// Short machine-readable code used in JSON error bodies
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::NotFound(_) => "NOT_FOUND",
            RegistryError::Conflict(_) => "CONFLICT",
            RegistryError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            RegistryError::DigestMismatch { .. } => "DIGEST_MISMATCH",
            RegistryError::Unauthorized(_) => "UNAUTHORIZED",
            RegistryError::Forbidden(_) => "FORBIDDEN",
            RegistryError::WriteRejected(_) => "WRITE_REJECTED",
            RegistryError::InvalidRequest(_) => "INVALID_REQUEST",
            RegistryError::Unsupported(_) => "UNSUPPORTED",
            RegistryError::Internal(_) => "INTERNAL",
        }
    }
}

/// Authentication-related errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    /// Invalid or expired token
    #[error("Invalid token")]
    InvalidToken,

    /// Token not found in database
    #[error("Token not found")]
    TokenNotFound,

    /// Invalid credentials for basic auth
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Rate limited due to too many failed attempts
    #[error("Rate limited: too many failed attempts")]
    RateLimited,

    /// Missing authorization header
    #[error("Missing authorization header")]
    MissingAuth,

    /// Token signing or encoding failed
    #[error("Token signing failed: {0}")]
    Signing(String),

    /// Credential store could not be read or written
    #[error("Credential store error: {0}")]
    Store(String),
}

/// Storage backend errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    /// IO failure in the backend
    #[error("Storage IO error: {0}")]
    Io(String),

    /// Key rejected by the backend
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// Named backend is not configured
    #[error("Unknown storage backend: {0}")]
    UnknownBackend(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Stored value could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Upstream registry errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpstreamError {
    /// Network timeout
    #[error("Network timeout")]
    NetworkTimeout,

    /// Connection refused
    #[error("Connection refused")]
    ConnectionRefused,

    /// Rate limited by upstream
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Server error
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Resource not found
    #[error("Resource not found")]
    NotFound,

    /// Upstream rejected our credentials or token
    #[error("Unauthorized")]
    Unauthorized,

    /// Bearer token exchange with the upstream realm failed
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// Invalid data received
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),
}

/// Proxy cache engine errors
///
/// Cloneable so a single upstream result can be handed to every coalesced waiter.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CacheError {
    /// Upstream failed and nothing usable was cached
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Backing storage failed
    #[error("Cache storage error: {0}")]
    Storage(#[from] StorageError),

    /// Upstream returned a body that does not hash to its digest
    #[error("Upstream digest mismatch for {0}")]
    Integrity(String),

    /// Sidecar metadata could not be encoded or decoded
    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

/// Request parsing errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Invalid path format
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Missing required parameter
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// Invalid package name
    #[error("Invalid package name: {0}")]
    InvalidPackageName(String),

    /// Invalid version
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Malformed request body
    #[error("Invalid body: {0}")]
    InvalidBody(String),
}

/// Errors raised by ecosystem plugins
#[derive(Debug, Error)]
pub enum PluginError {
    /// Package or version absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Version already exists and redeploy is disabled
    #[error("Version already exists: {0}")]
    AlreadyExists(String),

    /// Request could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Database failure
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Proxy cache failure
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Uploaded bytes do not match the asserted digest
    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch {
        /// Digest asserted by the client
        expected: String,
        /// Digest of the received bytes
        actual: String,
    },

    /// Operation not implemented by this plugin
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Listener lifecycle failure
    #[error("Listener error: {0}")]
    Listener(String),

    /// Port requested by a repository is already claimed
    #[error("Port {0} is already claimed")]
    PortClaimed(u16),

    /// Authentication failure in an ecosystem login flow
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Metadata could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<StorageError> for RegistryError {
    fn from(e: StorageError) -> Self {
        RegistryError::Internal(e.to_string())
    }
}

impl From<DbError> for RegistryError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => RegistryError::NotFound("record not found".to_string()),
            DbError::ConstraintViolation(msg) => RegistryError::Conflict(msg),
            other => RegistryError::Internal(other.to_string()),
        }
    }
}

impl From<CacheError> for RegistryError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Upstream(UpstreamError::NotFound) => {
                RegistryError::NotFound("not found upstream".to_string())
            }
            CacheError::Upstream(err) => RegistryError::UpstreamUnavailable(err.to_string()),
            CacheError::Integrity(msg) => RegistryError::UpstreamUnavailable(msg),
            CacheError::Storage(err) => RegistryError::Internal(err.to_string()),
            CacheError::Serialization(msg) => RegistryError::Internal(msg),
        }
    }
}

impl From<AuthError> for RegistryError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Signing(msg) | AuthError::Store(msg) => RegistryError::Internal(msg),
            other => RegistryError::Unauthorized(other.to_string()),
        }
    }
}

impl From<PluginError> for RegistryError {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::NotFound(what) => RegistryError::NotFound(what),
            PluginError::AlreadyExists(what) => RegistryError::Conflict(what),
            PluginError::PortClaimed(port) => {
                RegistryError::Conflict(format!("port {} is already claimed", port))
            }
            PluginError::Parse(err) => RegistryError::InvalidRequest(err.to_string()),
            PluginError::Storage(err) => err.into(),
            PluginError::Database(err) => err.into(),
            PluginError::Cache(err) => err.into(),
            PluginError::DigestMismatch { expected, actual } => {
                RegistryError::DigestMismatch { expected, actual }
            }
            PluginError::Unsupported(what) => RegistryError::Unsupported(what),
            PluginError::Auth(err) => err.into(),
            PluginError::Listener(msg) | PluginError::Serialization(msg) => {
                RegistryError::Internal(msg)
            }
        }
    }
}

/// Application-level error type
///
/// Aggregates the domain error types for startup and wiring code.
#[derive(Debug, Error)]
pub enum AppError {
    /// Registry operation error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;
}

impl RetryableError for UpstreamError {
    fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::NetworkTimeout => true,
            UpstreamError::ConnectionRefused => true,
            UpstreamError::RateLimited(_) => true,
            UpstreamError::ServerError(code) if *code >= 500 => true,
            UpstreamError::Network(_) => true,

            UpstreamError::ServerError(_) => false,
            UpstreamError::NotFound => false,
            UpstreamError::Unauthorized => false,
            UpstreamError::TokenExchange(_) => false,
            UpstreamError::InvalidData(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Error message formatting
    #[test]
    fn test_registry_error_messages() {
        assert_eq!(
            RegistryError::NotFound("npm/left-pad".to_string()).to_string(),
            "Not found: npm/left-pad"
        );
        assert_eq!(
            RegistryError::DigestMismatch {
                expected: "sha256:aa".to_string(),
                actual: "sha256:bb".to_string(),
            }
            .to_string(),
            "Digest mismatch: expected sha256:aa, computed sha256:bb"
        );
        assert_eq!(
            UpstreamError::RateLimited(60).to_string(),
            "Rate limited, retry after 60 seconds"
        );
    }

    // Test 2: Status codes follow the taxonomy
    #[test]
    fn test_registry_error_status_codes() {
        assert_eq!(RegistryError::NotFound(String::new()).status_code(), 404);
        assert_eq!(RegistryError::Conflict(String::new()).status_code(), 409);
        assert_eq!(
            RegistryError::UpstreamUnavailable(String::new()).status_code(),
            502
        );
        assert_eq!(RegistryError::Unauthorized(String::new()).status_code(), 401);
        assert_eq!(RegistryError::Forbidden(String::new()).status_code(), 403);
        assert_eq!(RegistryError::WriteRejected(String::new()).status_code(), 405);
    }

    // Test 3: Plugin errors convert at the router boundary
    #[test]
    fn test_plugin_error_conversion() {
        let err: RegistryError = PluginError::AlreadyExists("pkg@1.0.0".to_string()).into();
        assert_eq!(err, RegistryError::Conflict("pkg@1.0.0".to_string()));

        let err: RegistryError = PluginError::PortClaimed(5000).into();
        assert!(matches!(err, RegistryError::Conflict(_)));

        let err: RegistryError = PluginError::DigestMismatch {
            expected: "a".to_string(),
            actual: "b".to_string(),
        }
        .into();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
    }

    // Test 4: Cache errors map to gateway failures except upstream 404
    #[test]
    fn test_cache_error_conversion() {
        let err: RegistryError = CacheError::Upstream(UpstreamError::NotFound).into();
        assert!(matches!(err, RegistryError::NotFound(_)));

        let err: RegistryError = CacheError::Upstream(UpstreamError::NetworkTimeout).into();
        assert!(matches!(err, RegistryError::UpstreamUnavailable(_)));

        let err: RegistryError = DbError::ConstraintViolation("dup".to_string()).into();
        assert_eq!(err, RegistryError::Conflict("dup".to_string()));
    }

    // Test 5: Retryable classification
    #[test]
    fn test_retryable_errors() {
        assert!(UpstreamError::NetworkTimeout.is_retryable());
        assert!(UpstreamError::ServerError(503).is_retryable());
        assert!(!UpstreamError::ServerError(400).is_retryable());
        assert!(!UpstreamError::NotFound.is_retryable());
        assert!(!UpstreamError::TokenExchange("denied".to_string()).is_retryable());
    }
}
