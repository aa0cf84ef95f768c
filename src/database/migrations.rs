//! Database migrations for artifact-depot
//!
//! This module contains SQL migrations for the SQLite database schema.

/// SQL statement to create the initial database schema
pub const CREATE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Repositories table
CREATE TABLE IF NOT EXISTS repositories (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    repo_type TEXT NOT NULL,
    manager TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_repositories_manager ON repositories(manager);

-- Artifacts table
CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY,
    repository_id TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    path TEXT NOT NULL,
    storage_key TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    metadata TEXT,
    commit_sha TEXT,
    build_id TEXT,
    source_repo_url TEXT,
    created_at DATETIME NOT NULL,
    UNIQUE(repository_id, name, version, path)
);

CREATE INDEX IF NOT EXISTS idx_artifacts_repo_name ON artifacts(repository_id, name);

-- API tokens table
CREATE TABLE IF NOT EXISTS api_tokens (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    principal TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    expires_at DATETIME,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    last_used_at DATETIME,
    is_revoked INTEGER DEFAULT 0
);

-- Permission grants table
CREATE TABLE IF NOT EXISTS permissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    principal TEXT NOT NULL,
    action TEXT NOT NULL,
    repository_id TEXT NOT NULL DEFAULT '',
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(principal, action, repository_id)
);

CREATE INDEX IF NOT EXISTS idx_permissions_principal ON permissions(principal);
"#;

/// Get the current migration version
pub fn migration_version() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();
        conn
    }

    fn insert_repo(conn: &Connection, id: &str, name: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO repositories (id, name, repo_type, manager, created_at, updated_at)
             VALUES (?1, ?2, 'hosted', 'npm', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            [id, name],
        )
    }

    fn insert_artifact(conn: &Connection, id: &str, repo: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO artifacts (id, repository_id, name, version, path, storage_key,
             content_hash, size, content_type, created_at)
             VALUES (?1, ?2, 'pkg', '1.0.0', 'pkg-1.0.0.tgz', 'k', 'h', 1, 'x', '2024-01-01T00:00:00Z')",
            [id, repo],
        )
    }

    #[test]
    fn test_schema_creates_tables() {
        let conn = open();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(Result::ok)
            .collect();

        assert!(tables.contains(&"repositories".to_string()));
        assert!(tables.contains(&"artifacts".to_string()));
        assert!(tables.contains(&"api_tokens".to_string()));
        assert!(tables.contains(&"permissions".to_string()));
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = open();
        conn.execute_batch(CREATE_SCHEMA).unwrap();
    }

    #[test]
    fn test_repository_name_unique() {
        let conn = open();
        insert_repo(&conn, "r1", "npm-hosted").unwrap();
        assert!(insert_repo(&conn, "r2", "npm-hosted").is_err());
    }

    #[test]
    fn test_artifact_unique_per_repository() {
        let conn = open();
        insert_repo(&conn, "r1", "one").unwrap();
        insert_repo(&conn, "r2", "two").unwrap();

        insert_artifact(&conn, "a1", "r1").unwrap();
        assert!(insert_artifact(&conn, "a2", "r1").is_err());
        insert_artifact(&conn, "a3", "r2").unwrap();
    }

    #[test]
    fn test_artifacts_cascade_on_repository_delete() {
        let conn = open();
        insert_repo(&conn, "r1", "one").unwrap();
        insert_artifact(&conn, "a1", "r1").unwrap();

        conn.execute("DELETE FROM repositories WHERE id = 'r1'", [])
            .unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM artifacts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migration_version() {
        assert_eq!(migration_version(), 1);
    }
}
