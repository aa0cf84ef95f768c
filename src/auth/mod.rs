//! Authentication and authorization collaborators
//!
//! - API token generation and hashing
//! - Credential validation with failure rate limiting
//! - Permission verdicts and audit events
//! - Bearer tokens for the container registry protocol

pub mod audit;
pub mod manager;
pub mod permission;
pub mod ratelimit;
pub mod registry_token;
pub mod token;

pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use manager::{AuthManager, Credentials};
pub use permission::{authorize, AllowAll, DatabasePermissions, PermissionChecker};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use registry_token::{IssuedToken, RegistryClaims, RegistryTokenIssuer, Scope};
pub use token::{generate_token, hash_token, is_valid_token_format, verify_token, TOKEN_PREFIX};
