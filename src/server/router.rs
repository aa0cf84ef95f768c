//! HTTP router for artifact-depot
//!
//! This module defines the axum router that handles all HTTP requests.
//! It provides routes for:
//! - Health checks
//! - Repository, package, cache, token and permission management under `/api`
//! - Ecosystem-native endpoints under `/repository/{repo}/...`

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{any, delete, get},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::audit::record;
use crate::auth::{authorize, AuditEvent, AuditSink, AuthManager, DatabasePermissions, PermissionChecker};
use crate::error::RegistryError;
use crate::models::{
    Action, CreateRepositoryRequest, CreateTokenRequest, PermissionGrant, Principal, Repository,
    RepositoryConfig,
};
use crate::plugins::registry::NativeMethod;
use crate::router::RepositoryRouter;

use super::middleware::{principal_middleware, tracing_middleware};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Repository router
    pub router: Arc<RepositoryRouter>,

    /// Credential validation and API token administration
    pub auth: Arc<AuthManager>,

    /// Permission verdicts
    pub permissions: Arc<dyn PermissionChecker>,

    /// Grant administration; `None` when grants are not stored in the database
    pub grants: Option<Arc<DatabasePermissions>>,

    /// Audit destination
    pub audit: Arc<dyn AuditSink>,
}

impl AppState {
    /// Check a permission; everything is allowed while authentication is off
    pub async fn authorize(
        &self,
        principal: &Principal,
        action: Action,
        repo: Option<&Repository>,
    ) -> Result<(), RegistryError> {
        if !self.auth.is_enabled() {
            return Ok(());
        }
        authorize(self.permissions.as_ref(), principal, action, repo).await
    }

    async fn repository(&self, repo_ref: &str) -> Result<Repository, RegistryError> {
        self.router
            .get_repository(repo_ref)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("repository '{}'", repo_ref)))
    }

    async fn audit<T>(&self, event: AuditEvent, outcome: &Result<T, RegistryError>) {
        record(&self.audit, event, outcome).await;
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }
        let body = Json(json!({ "error": self.to_string(), "code": self.code() }));
        let mut response = (status, body).into_response();
        if matches!(self, RegistryError::Unauthorized(_)) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"artifact-depot\""),
            );
        }
        response
    }
}

type ApiResult<T> = Result<T, RegistryError>;

/// Build the main application router
///
/// `max_upload_bytes` bounds request bodies on every route.
pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/repositories",
            get(list_repositories_handler).post(create_repository_handler),
        )
        .route(
            "/api/repositories/:repo",
            get(get_repository_handler)
                .put(update_repository_handler)
                .delete(delete_repository_handler),
        )
        .route(
            "/api/repositories/:repo/packages",
            get(package_details_handler).delete(delete_version_handler),
        )
        .route("/api/repositories/:repo/versions", get(list_versions_handler))
        .route(
            "/api/repositories/:repo/cache",
            get(cache_stats_handler).delete(cache_clear_handler),
        )
        .route("/api/tokens", get(list_tokens_handler).post(create_token_handler))
        .route("/api/tokens/:id", delete(delete_token_handler))
        .route(
            "/api/permissions",
            get(list_permissions_handler)
                .post(grant_permission_handler)
                .delete(revoke_permission_handler),
        )
        .route("/repository/:repo", any(native_handler))
        .route("/repository/:repo/", any(native_handler))
        .route("/repository/:repo/*path", any(native_handler))
        .layer(middleware::from_fn_with_state(state.clone(), principal_middleware))
        .layer(middleware::from_fn(tracing_middleware))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// =============================================================================
// Repositories
// =============================================================================

async fn list_repositories_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<serde_json::Value>> {
    state.authorize(&principal, Action::Read, None).await?;
    let repositories = state.router.list_repositories().await?;
    Ok(Json(json!({ "repositories": repositories })))
}

async fn create_repository_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<CreateRepositoryRequest>,
) -> ApiResult<impl IntoResponse> {
    state.authorize(&principal, Action::Admin, None).await?;
    let event = AuditEvent::new(&principal.name, Action::Admin, "repository.create")
        .repository(&request.name);
    let outcome = state.router.create_repository(request).await;
    state.audit(event, &outcome).await;
    Ok((StatusCode::CREATED, Json(outcome?)))
}

async fn get_repository_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(repo): Path<String>,
) -> ApiResult<Json<Repository>> {
    let repo = state.repository(&repo).await?;
    state.authorize(&principal, Action::Read, Some(&repo)).await?;
    Ok(Json(repo))
}

async fn update_repository_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(repo): Path<String>,
    Json(config): Json<RepositoryConfig>,
) -> ApiResult<impl IntoResponse> {
    let repo = state.repository(&repo).await?;
    state.authorize(&principal, Action::Admin, Some(&repo)).await?;
    let event = AuditEvent::new(&principal.name, Action::Admin, "repository.update").repository(&repo.name);
    let outcome = state.router.update_repository(&repo.id, config).await;
    state.audit(event, &outcome).await;
    Ok(Json(outcome?))
}

async fn delete_repository_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(repo): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let repo = state.repository(&repo).await?;
    state.authorize(&principal, Action::Admin, Some(&repo)).await?;
    let event = AuditEvent::new(&principal.name, Action::Admin, "repository.delete").repository(&repo.name);
    let outcome = state.router.delete_repository(&repo.id).await;
    state.audit(event, &outcome).await;
    Ok(Json(outcome?))
}

// =============================================================================
// Packages
// =============================================================================

/// `?name=&version=` on package routes
#[derive(Debug, Deserialize)]
pub struct PackageQuery {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

async fn package_details_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(repo): Path<String>,
    Query(query): Query<PackageQuery>,
) -> ApiResult<impl IntoResponse> {
    let repo = state.repository(&repo).await?;
    state.authorize(&principal, Action::Read, Some(&repo)).await?;
    Ok(Json(state.router.get_package_details(&repo.id, &query.name).await?))
}

async fn list_versions_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(repo): Path<String>,
    Query(query): Query<PackageQuery>,
) -> ApiResult<impl IntoResponse> {
    let repo = state.repository(&repo).await?;
    state.authorize(&principal, Action::Read, Some(&repo)).await?;
    let versions = state.router.list_versions(&repo.id, &query.name).await?;
    Ok(Json(json!({ "name": query.name, "versions": versions })))
}

async fn delete_version_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(repo): Path<String>,
    Query(query): Query<PackageQuery>,
) -> ApiResult<impl IntoResponse> {
    let repo = state.repository(&repo).await?;
    state.authorize(&principal, Action::Delete, Some(&repo)).await?;
    let version = query
        .version
        .ok_or_else(|| RegistryError::InvalidRequest("version is required".to_string()))?;

    let event = AuditEvent::new(&principal.name, Action::Delete, "package.delete")
        .repository(&repo.name)
        .target(format!("{}@{}", query.name, version));
    let outcome = state
        .router
        .delete_package_version(&repo.id, &query.name, &version)
        .await;
    state.audit(event, &outcome).await;
    let removed = outcome?;
    if removed.is_empty() {
        return Err(RegistryError::NotFound(format!("{}@{}", query.name, version)));
    }
    Ok(Json(json!({ "deleted": removed.len(), "artifacts": removed })))
}

// =============================================================================
// Cache
// =============================================================================

async fn cache_stats_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(repo): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let repo = state.repository(&repo).await?;
    state.authorize(&principal, Action::Read, Some(&repo)).await?;
    Ok(Json(state.router.cache_stats(&repo.id).await?))
}

async fn cache_clear_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(repo): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let repo = state.repository(&repo).await?;
    state.authorize(&principal, Action::Admin, Some(&repo)).await?;
    let event = AuditEvent::new(&principal.name, Action::Admin, "cache.clear").repository(&repo.name);
    let outcome = state.router.clear_cache(&repo.id).await;
    state.audit(event, &outcome).await;
    Ok(Json(json!({ "cleared": outcome? })))
}

// =============================================================================
// Tokens
// =============================================================================

async fn list_tokens_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<impl IntoResponse> {
    state.authorize(&principal, Action::Admin, None).await?;
    let tokens = state.auth.list_tokens().await?;
    // Hashes stay server-side
    let tokens: Vec<serde_json::Value> = tokens
        .iter()
        .map(|t| {
            json!({
                "id": t.id,
                "name": t.name,
                "principal": t.principal,
                "created_at": t.created_at,
                "expires_at": t.expires_at,
                "last_used_at": t.last_used_at,
            })
        })
        .collect();
    Ok(Json(json!({ "tokens": tokens })))
}

async fn create_token_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<CreateTokenRequest>,
) -> ApiResult<impl IntoResponse> {
    state.authorize(&principal, Action::Admin, None).await?;
    let event = AuditEvent::new(&principal.name, Action::Admin, "token.create").target(&request.principal);
    let outcome = state.auth.create_token(request).await.map_err(RegistryError::from);
    state.audit(event, &outcome).await;
    Ok((StatusCode::CREATED, Json(outcome?)))
}

async fn delete_token_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.authorize(&principal, Action::Admin, None).await?;
    let event = AuditEvent::new(&principal.name, Action::Admin, "token.revoke").target(&id);
    let outcome = state.auth.revoke_token(&id).await.map_err(RegistryError::from);
    state.audit(event, &outcome).await;
    outcome?;
    Ok(Json(json!({ "message": "Token revoked" })))
}

// =============================================================================
// Permissions
// =============================================================================

/// `?principal=` on the permission listing
#[derive(Debug, Deserialize)]
pub struct PrincipalQuery {
    pub principal: String,
}

fn grants(state: &AppState) -> ApiResult<&Arc<DatabasePermissions>> {
    state
        .grants
        .as_ref()
        .ok_or_else(|| RegistryError::Unsupported("permission grants are not stored".to_string()))
}

/// Accept a repository name in a grant and store its id
async fn resolve_grant(state: &AppState, mut grant: PermissionGrant) -> ApiResult<PermissionGrant> {
    if let Some(repo_ref) = &grant.repository_id {
        grant.repository_id = Some(state.repository(repo_ref).await?.id);
    }
    Ok(grant)
}

async fn list_permissions_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<PrincipalQuery>,
) -> ApiResult<impl IntoResponse> {
    state.authorize(&principal, Action::Admin, None).await?;
    let list = grants(&state)?.list(&query.principal).await?;
    Ok(Json(json!({ "principal": query.principal, "grants": list })))
}

async fn grant_permission_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(grant): Json<PermissionGrant>,
) -> ApiResult<impl IntoResponse> {
    state.authorize(&principal, Action::Admin, None).await?;
    let store = grants(&state)?;
    let grant = resolve_grant(&state, grant).await?;
    let event = AuditEvent::new(&principal.name, Action::Admin, "permission.grant").target(&grant.principal);
    let outcome = store.grant(&grant).await;
    state.audit(event, &outcome).await;
    outcome?;
    Ok((StatusCode::CREATED, Json(grant)))
}

async fn revoke_permission_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(grant): Json<PermissionGrant>,
) -> ApiResult<impl IntoResponse> {
    state.authorize(&principal, Action::Admin, None).await?;
    let store = grants(&state)?;
    let grant = resolve_grant(&state, grant).await?;
    let event = AuditEvent::new(&principal.name, Action::Admin, "permission.revoke").target(&grant.principal);
    let outcome = store.revoke(&grant).await;
    state.audit(event, &outcome).await;
    outcome?;
    Ok(Json(json!({ "message": "Permission revoked" })))
}

// =============================================================================
// Ecosystem-native endpoints
// =============================================================================

fn native_method(method: &Method) -> ApiResult<(NativeMethod, Action)> {
    match *method {
        Method::GET | Method::HEAD => Ok((NativeMethod::Get, Action::Read)),
        Method::PUT => Ok((NativeMethod::Put, Action::Write)),
        Method::POST => Ok((NativeMethod::Post, Action::Write)),
        Method::DELETE => Ok((NativeMethod::Delete, Action::Delete)),
        _ => Err(RegistryError::Unsupported(format!("method {}", method))),
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect()
}

/// Any request below `/repository/{repo}/`
async fn native_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(params): Path<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let repo_ref = params.get("repo").map(String::as_str).unwrap_or_default();
    let path = params.get("path").map(String::as_str).unwrap_or_default();
    let repo = state.repository(repo_ref).await?;
    let (native, action) = native_method(&method)?;

    if native == NativeMethod::Get {
        state.authorize(&principal, action, Some(&repo)).await?;
        let response = state
            .router
            .download(&repo.id, path)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("{}/{}", repo.name, path)))?;
        let response = if method == Method::HEAD { response.head() } else { response };
        return Ok(response.into_response());
    }

    // Login requests carry their own credentials
    let plugin = state.router.plugins().get(repo.manager).map_err(RegistryError::from)?;
    let is_login = plugin.parse_login(path, &body).is_some();
    if !is_login {
        state.authorize(&principal, action, Some(&repo)).await?;
    }

    let operation = match (is_login, native) {
        (true, _) => "login",
        (false, NativeMethod::Delete) => "delete",
        _ => "upload",
    };
    let event = AuditEvent::new(&principal.name, action, operation)
        .repository(&repo.name)
        .target(path);
    let outcome = state
        .router
        .upload_raw(&repo.id, native, path, &header_pairs(&headers), body)
        .await;
    state.audit(event, &outcome).await;

    let response = outcome?;
    Ok(response.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TracingAuditSink;
    use crate::auth::AllowAll;
    use crate::config::{AuthConfig, CacheConfig};
    use crate::database::SqliteDatabase;
    use crate::plugins::cache::ProxyCache;
    use crate::storage::StorageSet;
    use crate::upstream::{RetryManager, UpstreamClient};
    use axum_test::TestServer;

    async fn create_test_state() -> AppState {
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let storage = StorageSet::in_memory();
        let upstream = Arc::new(UpstreamClient::with_client(
            reqwest::Client::new(),
            RetryManager::disabled(),
        ));
        let cache = Arc::new(ProxyCache::new(storage.clone(), upstream, CacheConfig::default()));
        let router = RepositoryRouter::new(db.clone(), storage, cache, "http://depot.test");
        AppState {
            router: Arc::new(router),
            auth: Arc::new(AuthManager::new(db, &AuthConfig::default())),
            permissions: Arc::new(AllowAll),
            grants: None,
            audit: Arc::new(TracingAuditSink),
        }
    }

    async fn server() -> TestServer {
        TestServer::new(build_router(create_test_state().await, 1024 * 1024)).unwrap()
    }

    // Test 1: Health endpoint returns OK
    #[tokio::test]
    async fn test_health_endpoint_returns_ok() {
        let server = server().await;
        let response = server.get("/health").await;
        response.assert_status_ok();

        let body: HealthResponse = response.json();
        assert_eq!(body.status, "healthy");
        assert!(!body.version.is_empty());
    }

    // Test 2: repositories can be created, listed and fetched by name
    #[tokio::test]
    async fn test_repository_crud() {
        let server = server().await;
        let created = server
            .post("/api/repositories")
            .json(&json!({ "name": "files", "type": "hosted", "manager": "raw" }))
            .await;
        created.assert_status(StatusCode::CREATED);
        let created: serde_json::Value = created.json();
        assert_eq!(created["repository"]["name"], "files");
        assert_eq!(created["listener"]["status"], "not_applicable");

        let list: serde_json::Value = server.get("/api/repositories").await.json();
        assert_eq!(list["repositories"].as_array().unwrap().len(), 1);

        server.get("/api/repositories/files").await.assert_status_ok();
        server
            .get("/api/repositories/missing")
            .await
            .assert_status(StatusCode::NOT_FOUND);

        server.delete("/api/repositories/files").await.assert_status_ok();
        server
            .get("/api/repositories/files")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    // Test 3: native upload, download, listing and duplicate rejection
    #[tokio::test]
    async fn test_native_round_trip() {
        let server = server().await;
        server
            .post("/api/repositories")
            .json(&json!({ "name": "files", "type": "hosted", "manager": "raw" }))
            .await
            .assert_status(StatusCode::CREATED);

        server
            .put("/repository/files/docs/readme.txt")
            .bytes(Bytes::from_static(b"hello"))
            .await
            .assert_status_success();
        let download = server.get("/repository/files/docs/readme.txt").await;
        download.assert_status_ok();
        assert_eq!(download.as_bytes().as_ref(), b"hello");

        server
            .put("/repository/files/docs/readme.txt")
            .bytes(Bytes::from_static(b"again"))
            .await
            .assert_status(StatusCode::CONFLICT);

        let versions: serde_json::Value = server
            .get("/api/repositories/files/versions")
            .add_query_param("name", "docs/readme.txt")
            .await
            .json();
        assert_eq!(versions["versions"], json!(["-"]));

        server
            .get("/repository/files/docs/missing.txt")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    // Test 4: deleting a version through the API
    #[tokio::test]
    async fn test_delete_version() {
        let server = server().await;
        server
            .post("/api/repositories")
            .json(&json!({ "name": "files", "type": "hosted", "manager": "raw" }))
            .await
            .assert_status(StatusCode::CREATED);
        server
            .put("/repository/files/a.bin")
            .bytes(Bytes::from_static(b"x"))
            .await
            .assert_status_success();

        let deleted = server
            .delete("/api/repositories/files/packages")
            .add_query_param("name", "a.bin")
            .add_query_param("version", "-")
            .await;
        deleted.assert_status_ok();
        assert_eq!(deleted.json::<serde_json::Value>()["deleted"], 1);

        server
            .get("/repository/files/a.bin")
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .delete("/api/repositories/files/packages")
            .add_query_param("name", "a.bin")
            .add_query_param("version", "-")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    // Test 5: permission routes report missing grant storage
    #[tokio::test]
    async fn test_permissions_unsupported_without_store() {
        let server = server().await;
        server
            .get("/api/permissions")
            .add_query_param("principal", "dev")
            .await
            .assert_status(StatusCode::NOT_IMPLEMENTED);
    }

    // Test 6: error bodies carry code and message
    #[tokio::test]
    async fn test_error_body() {
        let response = RegistryError::Unauthorized("credentials required".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let response = RegistryError::WriteRejected("proxy".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
