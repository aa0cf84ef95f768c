//! Permission collaborator
//!
//! Answers whether a principal may perform an action, optionally on one
//! repository. The router and the container listeners only consume the
//! verdict; grants live in the database.

use std::sync::Arc;

use async_trait::async_trait;

use crate::database::Database;
use crate::error::{DbError, RegistryError};
use crate::models::{Action, PermissionGrant, Principal, Repository};

/// Decides whether a principal may act
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Whether `principal` may perform `action` on `repository_id` (None = global)
    async fn has_permission(
        &self,
        principal: &Principal,
        action: Action,
        repository_id: Option<String>,
    ) -> Result<bool, RegistryError>;
}

/// Grants stored in the database
pub struct DatabasePermissions {
    db: Arc<dyn Database>,
    anonymous_read: bool,
}

impl DatabasePermissions {
    pub fn new(db: Arc<dyn Database>, anonymous_read: bool) -> Self {
        Self { db, anonymous_read }
    }

    /// Record a grant
    pub async fn grant(&self, grant: &PermissionGrant) -> Result<(), RegistryError> {
        self.db.grant_permission(grant).await?;
        tracing::info!(
            principal = %grant.principal,
            action = %grant.action,
            repository = grant.repository_id.as_deref().unwrap_or("*"),
            "Permission granted"
        );
        Ok(())
    }

    /// Remove a grant
    pub async fn revoke(&self, grant: &PermissionGrant) -> Result<(), RegistryError> {
        self.db.revoke_permission(grant).await.map_err(|e| match e {
            DbError::NotFound => RegistryError::NotFound(format!(
                "no {} grant for '{}'",
                grant.action, grant.principal
            )),
            other => other.into(),
        })
    }

    /// Grants held by a principal
    pub async fn list(&self, principal: &str) -> Result<Vec<PermissionGrant>, RegistryError> {
        Ok(self.db.list_permissions(principal).await?)
    }
}

#[async_trait]
impl PermissionChecker for DatabasePermissions {
    async fn has_permission(
        &self,
        principal: &Principal,
        action: Action,
        repository_id: Option<String>,
    ) -> Result<bool, RegistryError> {
        if principal.is_admin() {
            return Ok(true);
        }
        if principal.is_anonymous() {
            return Ok(self.anonymous_read && action == Action::Read);
        }
        // Any authenticated principal may read unless the repository says otherwise
        if action == Action::Read && self.anonymous_read {
            return Ok(true);
        }

        let grants = self.db.list_permissions(&principal.name).await?;
        Ok(grants
            .iter()
            .any(|g| g.covers(action, repository_id.as_deref())))
    }
}

/// Checker that allows everything; used when authentication is disabled
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn has_permission(
        &self,
        _principal: &Principal,
        _action: Action,
        _repository_id: Option<String>,
    ) -> Result<bool, RegistryError> {
        Ok(true)
    }
}

/// Turn a permission verdict into the error taxonomy
///
/// Anonymous callers are refused with `Unauthorized` so clients know to
/// retry with credentials; known principals get `Forbidden`.
pub async fn authorize(
    checker: &dyn PermissionChecker,
    principal: &Principal,
    action: Action,
    repo: Option<&Repository>,
) -> Result<(), RegistryError> {
    if let Some(repo) = repo {
        if principal.is_anonymous() && repo.config.auth_required {
            return Err(RegistryError::Unauthorized(format!(
                "repository '{}' requires credentials",
                repo.name
            )));
        }
    }
    if checker
        .has_permission(principal, action, repo.map(|r| r.id.clone()))
        .await?
    {
        return Ok(());
    }
    if principal.is_anonymous() {
        return Err(RegistryError::Unauthorized("credentials required".to_string()));
    }
    Err(RegistryError::Forbidden(format!(
        "'{}' may not {} {}",
        principal.name,
        action,
        repo.map_or_else(|| "globally".to_string(), |r| format!("in '{}'", r.name))
    )))
}
