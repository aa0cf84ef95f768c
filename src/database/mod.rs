//! Database layer for artifact-depot
//!
//! This module defines the database trait and SQLite implementation.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

use async_trait::async_trait;

use crate::error::DbError;
use crate::models::{ApiToken, Artifact, PermissionGrant, Repository};

/// Database trait for data persistence
///
/// This trait defines all database operations needed by the application.
/// It uses `async_trait` for async methods and `mockall::automock` for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Database: Send + Sync {
    // =========================================================================
    // Repository operations
    // =========================================================================

    /// Insert a repository; a duplicate name is a constraint violation
    async fn insert_repository(&self, repo: &Repository) -> Result<(), DbError>;

    /// Get a repository by id
    async fn get_repository(&self, id: &str) -> Result<Option<Repository>, DbError>;

    /// Get a repository by unique name
    async fn get_repository_by_name(&self, name: &str) -> Result<Option<Repository>, DbError>;

    /// List all repositories ordered by name
    async fn list_repositories(&self) -> Result<Vec<Repository>, DbError>;

    /// Replace a repository's name and config
    async fn update_repository(&self, repo: &Repository) -> Result<(), DbError>;

    /// Delete a repository and its artifact rows
    async fn delete_repository(&self, id: &str) -> Result<(), DbError>;

    // =========================================================================
    // Artifact operations
    // =========================================================================

    /// Insert an artifact; an existing (repository, name, version, path) is a constraint violation
    async fn insert_artifact(&self, artifact: &Artifact) -> Result<(), DbError>;

    /// Insert or replace an artifact with the same (repository, name, version, path),
    /// returning the row it replaced
    async fn upsert_artifact(&self, artifact: &Artifact) -> Result<Option<Artifact>, DbError>;

    /// Get one file of a version
    async fn get_artifact(
        &self,
        repository_id: &str,
        name: &str,
        version: &str,
        path: &str,
    ) -> Result<Option<Artifact>, DbError>;

    /// All files of all versions of a package, oldest first
    async fn list_artifacts(&self, repository_id: &str, name: &str)
        -> Result<Vec<Artifact>, DbError>;

    /// Every artifact of a repository
    async fn list_repository_artifacts(&self, repository_id: &str)
        -> Result<Vec<Artifact>, DbError>;

    /// Distinct package names in a repository
    async fn list_package_names(&self, repository_id: &str) -> Result<Vec<String>, DbError>;

    /// Delete every file of a version, returning the removed rows
    async fn delete_version(
        &self,
        repository_id: &str,
        name: &str,
        version: &str,
    ) -> Result<Vec<Artifact>, DbError>;

    /// Replace the metadata JSON of an artifact
    async fn update_artifact_metadata(
        &self,
        id: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), DbError>;

    // =========================================================================
    // Token operations
    // =========================================================================

    /// Create a new API token
    async fn create_token(&self, token: &ApiToken) -> Result<(), DbError>;

    /// Revoke a token by its ID
    async fn revoke_token(&self, id: &str) -> Result<(), DbError>;

    /// List all tokens (excluding revoked)
    async fn list_tokens(&self) -> Result<Vec<ApiToken>, DbError>;

    /// Update token's last used timestamp
    async fn update_token_last_used(&self, id: &str) -> Result<(), DbError>;

    // =========================================================================
    // Permission operations
    // =========================================================================

    /// Record a grant; granting twice is a no-op
    async fn grant_permission(&self, grant: &PermissionGrant) -> Result<(), DbError>;

    /// Remove a grant, NotFound if it did not exist
    async fn revoke_permission(&self, grant: &PermissionGrant) -> Result<(), DbError>;

    /// Grants held by a principal
    async fn list_permissions(&self, principal: &str) -> Result<Vec<PermissionGrant>, DbError>;

    /// Remove every grant scoped to a repository
    async fn delete_repository_permissions(&self, repository_id: &str) -> Result<u64, DbError>;
}
