//! SQLite implementation of the Database trait
//!
//! This module provides a SQLite-based implementation of the Database trait
//! using rusqlite and tokio-rusqlite for async operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row};
use tokio_rusqlite::Connection;

use super::migrations::CREATE_SCHEMA;
use super::Database;
use crate::error::DbError;
use crate::models::{
    ApiToken, Artifact, PermissionGrant, Provenance, Repository, RepositoryConfig,
};

const ARTIFACT_COLUMNS: &str = "id, repository_id, name, version, path, storage_key, \
     content_hash, size, content_type, metadata, commit_sha, build_id, source_repo_url, created_at";

const REPOSITORY_COLUMNS: &str = "id, name, repo_type, manager, config, created_at, updated_at";

/// SQLite database implementation
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| DbError::Serialization(e.to_string()))?;
                }
            }
        }

        let conn = Connection::open(path).await?;

        conn.call(|conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            Ok::<_, rusqlite::Error>(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(":memory:").await
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    // =========================================================================
    // Repository operations
    // =========================================================================

    async fn insert_repository(&self, repo: &Repository) -> Result<(), DbError> {
        let repo = repo.clone();
        let config = encode_json(&repo.config)?;
        let name = repo.name.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO repositories (id, name, repo_type, manager, config, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    rusqlite::params![
                        repo.id,
                        repo.name,
                        repo.repo_type.to_string(),
                        repo.manager.to_string(),
                        config,
                        repo.created_at.to_rfc3339(),
                        repo.updated_at.to_rfc3339()
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| map_constraint(e, format!("repository '{}' already exists", name)))
    }

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>, DbError> {
        let id = id.to_string();

        self.conn
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM repositories WHERE id = ?1", REPOSITORY_COLUMNS),
                    [&id],
                    row_to_repository,
                )
                .optional()
            })
            .await
            .map_err(Into::into)
    }

    async fn get_repository_by_name(&self, name: &str) -> Result<Option<Repository>, DbError> {
        let name = name.to_string();

        self.conn
            .call(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM repositories WHERE name = ?1",
                        REPOSITORY_COLUMNS
                    ),
                    [&name],
                    row_to_repository,
                )
                .optional()
            })
            .await
            .map_err(Into::into)
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>, DbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM repositories ORDER BY name",
                    REPOSITORY_COLUMNS
                ))?;
                let repos = stmt
                    .query_map([], row_to_repository)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(repos)
            })
            .await
            .map_err(Into::into)
    }

    async fn update_repository(&self, repo: &Repository) -> Result<(), DbError> {
        let repo = repo.clone();
        let config = encode_json(&repo.config)?;
        let name = repo.name.clone();

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE repositories SET name = ?2, config = ?3, updated_at = ?4
                    WHERE id = ?1
                    "#,
                    rusqlite::params![repo.id, repo.name, config, repo.updated_at.to_rfc3339()],
                )?;
                Ok(count)
            })
            .await
            .map_err(|e| map_constraint(e, format!("repository '{}' already exists", name)))?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn delete_repository(&self, id: &str) -> Result<(), DbError> {
        let id = id.to_string();

        let rows_affected = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM artifacts WHERE repository_id = ?1", [&id])?;
                let count = tx.execute("DELETE FROM repositories WHERE id = ?1", [&id])?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    // =========================================================================
    // Artifact operations
    // =========================================================================

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<(), DbError> {
        let what = format!("{}@{} ({})", artifact.name, artifact.version, artifact.path);
        let a = artifact.clone();
        self.conn
            .call(move |conn| write_artifact(conn, &a, "INSERT"))
            .await
            .map_err(|e| map_constraint(e, what))
    }

    async fn upsert_artifact(&self, artifact: &Artifact) -> Result<Option<Artifact>, DbError> {
        let what = format!("{}@{} ({})", artifact.name, artifact.version, artifact.path);
        let a = artifact.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let replaced = tx
                    .query_row(
                        &format!(
                            "SELECT {} FROM artifacts
                             WHERE repository_id = ?1 AND name = ?2 AND version = ?3 AND path = ?4",
                            ARTIFACT_COLUMNS
                        ),
                        rusqlite::params![a.repository_id, a.name, a.version, a.path],
                        row_to_artifact,
                    )
                    .optional()?;
                write_artifact(&tx, &a, "INSERT OR REPLACE")?;
                tx.commit()?;
                Ok(replaced)
            })
            .await
            .map_err(|e| map_constraint(e, what))
    }

    async fn get_artifact(
        &self,
        repository_id: &str,
        name: &str,
        version: &str,
        path: &str,
    ) -> Result<Option<Artifact>, DbError> {
        let params = [
            repository_id.to_string(),
            name.to_string(),
            version.to_string(),
            path.to_string(),
        ];

        self.conn
            .call(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM artifacts
                         WHERE repository_id = ?1 AND name = ?2 AND version = ?3 AND path = ?4",
                        ARTIFACT_COLUMNS
                    ),
                    rusqlite::params_from_iter(params.iter()),
                    row_to_artifact,
                )
                .optional()
            })
            .await
            .map_err(Into::into)
    }

    async fn list_artifacts(
        &self,
        repository_id: &str,
        name: &str,
    ) -> Result<Vec<Artifact>, DbError> {
        let repository_id = repository_id.to_string();
        let name = name.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM artifacts WHERE repository_id = ?1 AND name = ?2
                     ORDER BY created_at, rowid",
                    ARTIFACT_COLUMNS
                ))?;
                let artifacts = stmt
                    .query_map([&repository_id, &name], row_to_artifact)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(artifacts)
            })
            .await
            .map_err(Into::into)
    }

    async fn list_repository_artifacts(
        &self,
        repository_id: &str,
    ) -> Result<Vec<Artifact>, DbError> {
        let repository_id = repository_id.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM artifacts WHERE repository_id = ?1
                     ORDER BY name, created_at, rowid",
                    ARTIFACT_COLUMNS
                ))?;
                let artifacts = stmt
                    .query_map([&repository_id], row_to_artifact)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(artifacts)
            })
            .await
            .map_err(Into::into)
    }

    async fn list_package_names(&self, repository_id: &str) -> Result<Vec<String>, DbError> {
        let repository_id = repository_id.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT name FROM artifacts WHERE repository_id = ?1 ORDER BY name",
                )?;
                let names = stmt
                    .query_map([&repository_id], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok::<_, rusqlite::Error>(names)
            })
            .await
            .map_err(Into::into)
    }

    async fn delete_version(
        &self,
        repository_id: &str,
        name: &str,
        version: &str,
    ) -> Result<Vec<Artifact>, DbError> {
        let params = [
            repository_id.to_string(),
            name.to_string(),
            version.to_string(),
        ];

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let removed = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {} FROM artifacts
                         WHERE repository_id = ?1 AND name = ?2 AND version = ?3",
                        ARTIFACT_COLUMNS
                    ))?;
                    let rows = stmt
                        .query_map(rusqlite::params_from_iter(params.iter()), row_to_artifact)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };
                tx.execute(
                    "DELETE FROM artifacts WHERE repository_id = ?1 AND name = ?2 AND version = ?3",
                    rusqlite::params_from_iter(params.iter()),
                )?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(removed)
            })
            .await
            .map_err(Into::into)
    }

    async fn update_artifact_metadata(
        &self,
        id: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), DbError> {
        let id = id.to_string();
        let metadata = encode_json(metadata)?;

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    "UPDATE artifacts SET metadata = ?2 WHERE id = ?1",
                    [&id, &metadata],
                )?;
                Ok::<_, rusqlite::Error>(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    // =========================================================================
    // Token operations
    // =========================================================================

    async fn create_token(&self, token: &ApiToken) -> Result<(), DbError> {
        let token = token.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO api_tokens
                    (id, name, principal, token_hash, expires_at, created_at, last_used_at, is_revoked)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                    rusqlite::params![
                        token.id,
                        token.name,
                        token.principal,
                        token.token_hash,
                        token.expires_at.map(|dt| dt.to_rfc3339()),
                        token.created_at.to_rfc3339(),
                        token.last_used_at.map(|dt| dt.to_rfc3339()),
                        token.is_revoked as i32
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| map_constraint(e, "token already exists".to_string()))
    }

    async fn revoke_token(&self, id: &str) -> Result<(), DbError> {
        let id = id.to_string();

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count =
                    conn.execute("UPDATE api_tokens SET is_revoked = 1 WHERE id = ?1", [&id])?;
                Ok::<_, rusqlite::Error>(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn list_tokens(&self) -> Result<Vec<ApiToken>, DbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, name, principal, token_hash, expires_at, created_at, last_used_at, is_revoked
                    FROM api_tokens
                    WHERE is_revoked = 0
                    ORDER BY created_at DESC
                    "#,
                )?;

                let tokens = stmt
                    .query_map([], |row| {
                        Ok(ApiToken {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            principal: row.get(2)?,
                            token_hash: row.get(3)?,
                            expires_at: parse_datetime(row.get::<_, Option<String>>(4)?),
                            created_at: parse_datetime(row.get::<_, Option<String>>(5)?)
                                .unwrap_or_else(Utc::now),
                            last_used_at: parse_datetime(row.get::<_, Option<String>>(6)?),
                            is_revoked: row.get::<_, i32>(7)? != 0,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok::<_, rusqlite::Error>(tokens)
            })
            .await
            .map_err(Into::into)
    }

    async fn update_token_last_used(&self, id: &str) -> Result<(), DbError> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE api_tokens SET last_used_at = ?2 WHERE id = ?1",
                    [&id, &now],
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(Into::into)
    }

    // =========================================================================
    // Permission operations
    // =========================================================================

    async fn grant_permission(&self, grant: &PermissionGrant) -> Result<(), DbError> {
        let principal = grant.principal.clone();
        let action = grant.action.to_string();
        let repository_id = grant.repository_id.clone().unwrap_or_default();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT OR IGNORE INTO permissions (principal, action, repository_id)
                    VALUES (?1, ?2, ?3)
                    "#,
                    [&principal, &action, &repository_id],
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(Into::into)
    }

    async fn revoke_permission(&self, grant: &PermissionGrant) -> Result<(), DbError> {
        let principal = grant.principal.clone();
        let action = grant.action.to_string();
        let repository_id = grant.repository_id.clone().unwrap_or_default();

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    "DELETE FROM permissions WHERE principal = ?1 AND action = ?2 AND repository_id = ?3",
                    [&principal, &action, &repository_id],
                )?;
                Ok::<_, rusqlite::Error>(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn list_permissions(&self, principal: &str) -> Result<Vec<PermissionGrant>, DbError> {
        let principal = principal.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT principal, action, repository_id FROM permissions
                    WHERE principal = ?1
                    ORDER BY action, repository_id
                    "#,
                )?;
                let grants = stmt
                    .query_map([&principal], |row| {
                        let action: String = row.get(1)?;
                        let repository_id: String = row.get(2)?;
                        Ok(PermissionGrant {
                            principal: row.get(0)?,
                            action: action.parse().map_err(|e| {
                                rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
                            })?,
                            repository_id: if repository_id.is_empty() {
                                None
                            } else {
                                Some(repository_id)
                            },
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(grants)
            })
            .await
            .map_err(Into::into)
    }

    async fn delete_repository_permissions(&self, repository_id: &str) -> Result<u64, DbError> {
        let repository_id = repository_id.to_string();

        self.conn
            .call(move |conn| {
                let count =
                    conn.execute("DELETE FROM permissions WHERE repository_id = ?1", [&repository_id])?;
                Ok::<_, rusqlite::Error>(count as u64)
            })
            .await
            .map_err(Into::into)
    }
}

fn write_artifact(
    conn: &rusqlite::Connection,
    a: &Artifact,
    verb: &'static str,
) -> Result<(), rusqlite::Error> {
    let metadata = if a.metadata.is_null() {
        None
    } else {
        Some(a.metadata.to_string())
    };
    let provenance = a.provenance.clone().unwrap_or_default();

    conn.execute(
        &format!(
            "{} INTO artifacts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            verb, ARTIFACT_COLUMNS
        ),
        rusqlite::params![
            a.id,
            a.repository_id,
            a.name,
            a.version,
            a.path,
            a.storage_key,
            a.content_hash,
            a.size as i64,
            a.content_type,
            metadata,
            provenance.commit_sha,
            provenance.build_id,
            provenance.source_repo_url,
            a.created_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

fn row_to_repository(row: &Row<'_>) -> rusqlite::Result<Repository> {
    let repo_type: String = row.get(2)?;
    let manager: String = row.get(3)?;
    let config: String = row.get(4)?;

    Ok(Repository {
        id: row.get(0)?,
        name: row.get(1)?,
        repo_type: repo_type
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
        manager: manager
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        config: serde_json::from_str::<RepositoryConfig>(&config)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        created_at: parse_datetime(row.get::<_, Option<String>>(5)?).unwrap_or_else(Utc::now),
        updated_at: parse_datetime(row.get::<_, Option<String>>(6)?).unwrap_or_else(Utc::now),
    })
}

fn row_to_artifact(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    let metadata: Option<String> = row.get(9)?;
    let provenance = Provenance {
        commit_sha: row.get(10)?,
        build_id: row.get(11)?,
        source_repo_url: row.get(12)?,
    };

    Ok(Artifact {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        name: row.get(2)?,
        version: row.get(3)?,
        path: row.get(4)?,
        storage_key: row.get(5)?,
        content_hash: row.get(6)?,
        size: row.get::<_, i64>(7)? as u64,
        content_type: row.get(8)?,
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or(serde_json::Value::Null),
        provenance: if provenance.is_empty() {
            None
        } else {
            Some(provenance)
        },
        created_at: parse_datetime(row.get::<_, Option<String>>(13)?).unwrap_or_else(Utc::now),
    })
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, DbError> {
    serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))
}

/// Map unique-constraint failures to a readable conflict
fn map_constraint(err: rusqlite::Error, what: String) -> DbError {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            DbError::ConstraintViolation(what)
        }
        other => DbError::Sqlite(other),
    }
}

/// Parse datetime string from SQLite
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // Try parsing SQLite's datetime format
                chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, Manager, RepositoryType};

    fn hosted(name: &str) -> Repository {
        Repository::new(
            name,
            RepositoryType::Hosted,
            Manager::Npm,
            RepositoryConfig::default(),
        )
    }

    fn artifact(repo: &Repository, version: &str) -> Artifact {
        Artifact::new(&repo.id, "left-pad", version, format!("left-pad-{}.tgz", version))
            .with_content(format!("k/{}", version), "abc", 3)
    }

    // Test 1: Create in-memory database
    #[tokio::test]
    async fn test_create_in_memory_database() {
        let db = SqliteDatabase::in_memory().await;
        assert!(db.is_ok());
    }

    // Test 2: Repository insert and lookup by id and name
    #[tokio::test]
    async fn test_repository_roundtrip() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        let mut repo = hosted("npm-internal");
        repo.config.allow_redeploy = true;
        db.insert_repository(&repo).await.unwrap();

        let by_id = db.get_repository(&repo.id).await.unwrap().unwrap();
        let by_name = db.get_repository_by_name("npm-internal").await.unwrap().unwrap();
        assert_eq!(by_id.id, by_name.id);
        assert!(by_id.config.allow_redeploy);
        assert_eq!(by_id.manager, Manager::Npm);

        assert!(db.get_repository("missing").await.unwrap().is_none());
    }

    // Test 3: Duplicate repository names are constraint violations
    #[tokio::test]
    async fn test_duplicate_repository_name() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        db.insert_repository(&hosted("dup")).await.unwrap();
        let result = db.insert_repository(&hosted("dup")).await;
        assert!(matches!(result, Err(DbError::ConstraintViolation(_))));
    }

    // Test 4: Update and delete report NotFound for unknown ids
    #[tokio::test]
    async fn test_update_delete_not_found() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        let repo = hosted("ghost");
        assert!(matches!(
            db.update_repository(&repo).await,
            Err(DbError::NotFound)
        ));
        assert!(matches!(
            db.delete_repository(&repo.id).await,
            Err(DbError::NotFound)
        ));
    }

    // Test 5: Artifact uniqueness and upsert
    #[tokio::test]
    async fn test_artifact_insert_conflict_and_upsert() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        let repo = hosted("r");
        db.insert_repository(&repo).await.unwrap();

        db.insert_artifact(&artifact(&repo, "1.0.0")).await.unwrap();
        let dup = db.insert_artifact(&artifact(&repo, "1.0.0")).await;
        assert!(matches!(dup, Err(DbError::ConstraintViolation(_))));

        let replacement = artifact(&repo, "1.0.0").with_content("k/new", "def", 9);
        let replaced = db.upsert_artifact(&replacement).await.unwrap();
        assert_eq!(replaced.unwrap().storage_key, "k/1.0.0");

        let stored = db
            .get_artifact(&repo.id, "left-pad", "1.0.0", "left-pad-1.0.0.tgz")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.storage_key, "k/new");
        assert_eq!(stored.size, 9);
    }

    // Test 6: Listing and version deletion
    #[tokio::test]
    async fn test_list_and_delete_version() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        let repo = hosted("r");
        db.insert_repository(&repo).await.unwrap();
        db.insert_artifact(&artifact(&repo, "1.0.0")).await.unwrap();
        db.insert_artifact(&artifact(&repo, "1.1.0")).await.unwrap();

        assert_eq!(db.list_artifacts(&repo.id, "left-pad").await.unwrap().len(), 2);
        assert_eq!(
            db.list_package_names(&repo.id).await.unwrap(),
            vec!["left-pad".to_string()]
        );

        let removed = db.delete_version(&repo.id, "left-pad", "1.0.0").await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].storage_key, "k/1.0.0");
        assert_eq!(db.list_artifacts(&repo.id, "left-pad").await.unwrap().len(), 1);

        let none = db.delete_version(&repo.id, "left-pad", "9.9.9").await.unwrap();
        assert!(none.is_empty());
    }

    // Test 7: Metadata and provenance survive storage
    #[tokio::test]
    async fn test_artifact_metadata_and_provenance() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        let repo = hosted("r");
        db.insert_repository(&repo).await.unwrap();

        let a = artifact(&repo, "2.0.0")
            .with_metadata(serde_json::json!({"deps": []}))
            .with_provenance(Some(Provenance {
                build_id: Some("ci-42".to_string()),
                ..Default::default()
            }));
        db.insert_artifact(&a).await.unwrap();
        db.update_artifact_metadata(&a.id, &serde_json::json!({"yanked": true}))
            .await
            .unwrap();

        let stored = db
            .get_artifact(&repo.id, "left-pad", "2.0.0", "left-pad-2.0.0.tgz")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.metadata["yanked"], true);
        assert_eq!(stored.provenance.unwrap().build_id, Some("ci-42".to_string()));
    }

    // Test 8: Deleting a repository removes its artifacts
    #[tokio::test]
    async fn test_delete_repository_removes_artifacts() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        let repo = hosted("r");
        db.insert_repository(&repo).await.unwrap();
        db.insert_artifact(&artifact(&repo, "1.0.0")).await.unwrap();

        db.delete_repository(&repo.id).await.unwrap();
        assert!(db.list_repository_artifacts(&repo.id).await.unwrap().is_empty());
        assert!(db.list_repositories().await.unwrap().is_empty());
    }

    // Test 9: Token lifecycle
    #[tokio::test]
    async fn test_token_lifecycle() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        let token = ApiToken::new("t1", "ci", "builder", "hash-1");
        db.create_token(&token).await.unwrap();

        let tokens = db.list_tokens().await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].principal, "builder");

        db.update_token_last_used("t1").await.unwrap();
        db.revoke_token("t1").await.unwrap();
        assert!(db.list_tokens().await.unwrap().is_empty());
        assert!(matches!(
            db.revoke_token("nonexistent").await,
            Err(DbError::NotFound)
        ));
    }

    // Test 10: Permission grant, list, revoke
    #[tokio::test]
    async fn test_permissions() {
        let db = SqliteDatabase::in_memory().await.unwrap();
        let grant = PermissionGrant {
            principal: "dev".to_string(),
            action: Action::Write,
            repository_id: Some("repo-1".to_string()),
        };
        let global = PermissionGrant {
            principal: "dev".to_string(),
            action: Action::Read,
            repository_id: None,
        };

        db.grant_permission(&grant).await.unwrap();
        db.grant_permission(&grant).await.unwrap();
        db.grant_permission(&global).await.unwrap();

        let grants = db.list_permissions("dev").await.unwrap();
        assert_eq!(grants.len(), 2);
        assert!(grants.contains(&global));

        assert_eq!(db.delete_repository_permissions("repo-1").await.unwrap(), 1);
        assert!(matches!(
            db.revoke_permission(&grant).await,
            Err(DbError::NotFound)
        ));
        db.revoke_permission(&global).await.unwrap();
        assert!(db.list_permissions("dev").await.unwrap().is_empty());
    }
}
