//! Credential and permission models
//!
//! API tokens are this server's own credential. Permission grants bind a
//! principal to an action, optionally scoped to one repository.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Name of the built-in administrator principal
pub const ADMIN_PRINCIPAL: &str = "admin";

/// Name used for unauthenticated callers
pub const ANONYMOUS_PRINCIPAL: &str = "anonymous";

/// API token stored in database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiToken {
    /// Unique token ID
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Principal the token authenticates as
    pub principal: String,

    /// Hashed token value (argon2id)
    pub token_hash: String,

    /// When the token expires (None = never)
    pub expires_at: Option<DateTime<Utc>>,

    /// When the token was created
    pub created_at: DateTime<Utc>,

    /// When the token was last used
    pub last_used_at: Option<DateTime<Utc>>,

    /// Whether the token has been revoked
    pub is_revoked: bool,
}

impl ApiToken {
    /// Create a new token
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        principal: impl Into<String>,
        token_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            principal: principal.into(),
            token_hash: token_hash.into(),
            expires_at: None,
            created_at: Utc::now(),
            last_used_at: None,
            is_revoked: false,
        }
    }

    /// Set expiration time
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Check if the token is valid (not expired and not revoked)
    pub fn is_valid(&self) -> bool {
        if self.is_revoked {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => expires_at >= Utc::now(),
            None => true,
        }
    }
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// Principal name
    pub name: String,

    /// Token id when authenticated by API token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
}

impl Principal {
    /// A named principal
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token_id: None,
        }
    }

    /// The unauthenticated caller
    pub fn anonymous() -> Self {
        Self::named(ANONYMOUS_PRINCIPAL)
    }

    /// The built-in administrator
    pub fn admin() -> Self {
        Self::named(ADMIN_PRINCIPAL)
    }

    /// Whether this is the unauthenticated caller
    pub fn is_anonymous(&self) -> bool {
        self.name == ANONYMOUS_PRINCIPAL
    }

    /// Whether this is the administrator
    pub fn is_admin(&self) -> bool {
        self.name == ADMIN_PRINCIPAL
    }
}

impl From<&ApiToken> for Principal {
    fn from(token: &ApiToken) -> Self {
        Self {
            name: token.principal.clone(),
            token_id: Some(token.id.clone()),
        }
    }
}

/// Request to create a new API token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    /// Human-readable name for the token
    pub name: String,

    /// Principal the token acts as
    pub principal: String,

    /// When the token should expire (None = never)
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Response when a token is created (includes the raw token value)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTokenResponse {
    /// Token ID
    pub id: String,

    /// Token name
    pub name: String,

    /// Principal
    pub principal: String,

    /// Raw token value (only shown once at creation)
    pub token: String,

    /// When the token expires
    pub expires_at: Option<DateTime<Utc>>,

    /// When the token was created
    pub created_at: DateTime<Utc>,
}

/// Action checked by the permission collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Download and list
    Read,
    /// Upload
    Write,
    /// Delete versions
    Delete,
    /// Repository and credential administration
    Admin,
}

impl Action {
    /// Lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Delete => "delete",
            Action::Admin => "admin",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Action::Read),
            "write" => Ok(Action::Write),
            "delete" => Ok(Action::Delete),
            "admin" => Ok(Action::Admin),
            other => Err(ParseError::MissingParameter(format!(
                "unknown action '{}'",
                other
            ))),
        }
    }
}

/// A stored permission grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Principal name
    pub principal: String,

    /// Granted action
    pub action: Action,

    /// Repository the grant is limited to; None means every repository
    #[serde(default)]
    pub repository_id: Option<String>,
}

impl PermissionGrant {
    /// Whether this grant covers the requested action on the repository
    pub fn covers(&self, action: Action, repository_id: Option<&str>) -> bool {
        let action_ok = self.action == action
            || self.action == Action::Admin
            || (self.action == Action::Write && action == Action::Read);
        let repo_ok = match (&self.repository_id, repository_id) {
            (None, _) => true,
            (Some(granted), Some(requested)) => granted == requested,
            (Some(_), None) => false,
        };
        action_ok && repo_ok
    }
}
