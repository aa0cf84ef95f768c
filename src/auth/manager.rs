//! Credential validation and API token administration
//!
//! Callers authenticate with an API token (as a Bearer token or as the
//! password of Basic auth) or as the administrator with the configured
//! password. Failures are throttled per client IP.

use std::net::IpAddr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;

use crate::config::AuthConfig;
use crate::database::Database;
use crate::error::{AuthError, DbError};
use crate::models::{ApiToken, CreateTokenRequest, CreateTokenResponse, Principal, ADMIN_PRINCIPAL};

use super::ratelimit::{RateLimitConfig, RateLimiter};
use super::token::{generate_token, hash_token, is_valid_token_format, verify_token};

/// Basic-auth username that accepts any API token regardless of its principal
pub const TOKEN_USERNAME: &str = "token";

/// Credentials carried by a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// `Authorization: Bearer <value>`
    Bearer(String),
    /// `Authorization: Basic <base64(user:password)>`
    Basic { username: String, password: String },
}

impl Credentials {
    /// Parse an Authorization header value
    ///
    /// A value without a scheme is a bare token, as cargo sends it.
    pub fn parse(header: &str) -> Result<Self, AuthError> {
        let header = header.trim();
        let Some((scheme, value)) = header.split_once(' ') else {
            if header.is_empty() {
                return Err(AuthError::InvalidCredentials);
            }
            return Ok(Credentials::Bearer(header.to_string()));
        };
        let value = value.trim();

        if scheme.eq_ignore_ascii_case("bearer") {
            return Ok(Credentials::Bearer(value.to_string()));
        }
        if scheme.eq_ignore_ascii_case("basic") {
            let decoded = STANDARD
                .decode(value)
                .map_err(|_| AuthError::InvalidCredentials)?;
            let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidCredentials)?;
            let (username, password) = decoded
                .split_once(':')
                .ok_or(AuthError::InvalidCredentials)?;
            return Ok(Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        Err(AuthError::InvalidCredentials)
    }
}

/// Authentication manager
pub struct AuthManager {
    db: Arc<dyn Database>,
    enabled: bool,
    admin_password_hash: Option<String>,
    rate_limiter: RateLimiter,
}

impl AuthManager {
    /// Create a new authentication manager
    pub fn new(db: Arc<dyn Database>, config: &AuthConfig) -> Self {
        Self {
            db,
            enabled: config.enabled,
            admin_password_hash: config.admin_password_hash.clone(),
            rate_limiter: RateLimiter::new(RateLimitConfig::from(&config.rate_limit)),
        }
    }

    /// Whether the API requires credentials
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Authenticate whatever credentials an Authorization header carries
    pub async fn authenticate(
        &self,
        credentials: &Credentials,
        ip: Option<IpAddr>,
    ) -> Result<Principal, AuthError> {
        match credentials {
            Credentials::Bearer(token) => self.validate_token(token, ip).await,
            Credentials::Basic { username, password } => {
                self.validate_basic_auth(username, password, ip).await
            }
        }
    }

    /// Validate a raw API token
    pub async fn validate_token(
        &self,
        token: &str,
        ip: Option<IpAddr>,
    ) -> Result<Principal, AuthError> {
        self.check_blocked(ip)?;

        if !is_valid_token_format(token) {
            self.fail(ip);
            return Err(AuthError::InvalidToken);
        }

        // Hashes are salted, so every live token has to be tried
        let tokens = self
            .db
            .list_tokens()
            .await
            .map_err(|e| AuthError::Store(e.to_string()))?;

        let Some(stored) = tokens
            .into_iter()
            .find(|t| verify_token(token, &t.token_hash))
        else {
            self.fail(ip);
            return Err(AuthError::TokenNotFound);
        };

        if !stored.is_valid() {
            self.fail(ip);
            return Err(AuthError::InvalidToken);
        }

        if let Err(e) = self.db.update_token_last_used(&stored.id).await {
            tracing::warn!(token_id = %stored.id, error = %e, "Failed to record token use");
        }
        self.succeed(ip);

        Ok(Principal::from(&stored))
    }

    /// Validate Basic credentials
    ///
    /// The admin user checks the configured password hash. Any other user
    /// must present an API token issued to that principal as the password,
    /// or log in as `token` with any valid API token.
    pub async fn validate_basic_auth(
        &self,
        username: &str,
        password: &str,
        ip: Option<IpAddr>,
    ) -> Result<Principal, AuthError> {
        self.check_blocked(ip)?;

        if username == ADMIN_PRINCIPAL && !is_valid_token_format(password) {
            let verified = self
                .admin_password_hash
                .as_deref()
                .map_or(false, |hash| verify_token(password, hash));
            if !verified {
                self.fail(ip);
                return Err(AuthError::InvalidCredentials);
            }
            self.succeed(ip);
            return Ok(Principal::admin());
        }

        let principal = self.validate_token(password, ip).await?;
        if username != TOKEN_USERNAME && principal.name != username {
            self.fail(ip);
            return Err(AuthError::InvalidCredentials);
        }
        Ok(principal)
    }

    /// Issue a new API token; the raw value is only returned here
    pub async fn create_token(
        &self,
        request: CreateTokenRequest,
    ) -> Result<CreateTokenResponse, AuthError> {
        let generated = generate_token();
        let hash = hash_token(&generated.raw)?;

        let mut token = ApiToken::new(&generated.id, &request.name, &request.principal, hash);
        if let Some(expires_at) = request.expires_at {
            token = token.with_expires_at(expires_at);
        }

        self.db
            .create_token(&token)
            .await
            .map_err(|e| AuthError::Store(e.to_string()))?;

        tracing::info!(token_id = %token.id, principal = %token.principal, "API token created");

        Ok(CreateTokenResponse {
            id: token.id,
            name: token.name,
            principal: token.principal,
            token: generated.raw,
            expires_at: token.expires_at,
            created_at: Utc::now(),
        })
    }

    /// Revoke a token by id
    pub async fn revoke_token(&self, id: &str) -> Result<(), AuthError> {
        self.db.revoke_token(id).await.map_err(|e| match e {
            DbError::NotFound => AuthError::TokenNotFound,
            other => AuthError::Store(other.to_string()),
        })
    }

    /// Live tokens (hashes included, raw values are unrecoverable)
    pub async fn list_tokens(&self) -> Result<Vec<ApiToken>, AuthError> {
        self.db
            .list_tokens()
            .await
            .map_err(|e| AuthError::Store(e.to_string()))
    }

    /// Whether an IP is currently throttled
    pub fn is_rate_limited(&self, ip: IpAddr) -> bool {
        self.rate_limiter.is_blocked(ip)
    }

    fn check_blocked(&self, ip: Option<IpAddr>) -> Result<(), AuthError> {
        match ip {
            Some(ip) if self.rate_limiter.is_blocked(ip) => Err(AuthError::RateLimited),
            _ => Ok(()),
        }
    }

    fn fail(&self, ip: Option<IpAddr>) {
        if let Some(ip) = ip {
            if self.rate_limiter.record_failure(ip) {
                tracing::warn!(%ip, "Client blocked after repeated authentication failures");
            }
        }
    }

    fn succeed(&self, ip: Option<IpAddr>) {
        if let Some(ip) = ip {
            self.rate_limiter.reset(ip);
        }
    }
}
