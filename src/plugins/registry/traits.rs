//! Registry plugin trait definition
//!
//! Every ecosystem implements [`RegistryPlugin`]. The router resolves a
//! repository and hands the plugin a [`PluginContext`] describing it; the
//! plugin never decides routing by repository type itself, except where the
//! default methods below split hosted reads from proxied ones.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::auth::AuthManager;
use crate::database::Database;
use crate::digest::ContentDigest;
use crate::error::PluginError;
use crate::models::{
    Artifact, Manager, PackageDetails, Principal, Provenance, Repository, RepositoryType,
};
use crate::plugins::cache::{Addressing, CachedResponse, ProxyCache, UpstreamRequest};
use crate::storage::Storage;

use super::hosted;
use super::version;

/// Everything a plugin needs to serve one repository
#[derive(Clone)]
pub struct PluginContext {
    /// Repository being served
    pub repository: Repository,

    /// Backend holding the repository's bytes
    pub storage: Arc<dyn Storage>,

    /// Artifact rows
    pub db: Arc<dyn Database>,

    /// Shared proxy cache
    pub cache: Arc<ProxyCache>,

    /// Absolute URL clients use to reach this repository, without a trailing slash
    ///
    /// For a group member this is the group's URL, so rendered documents point
    /// back through the group.
    pub base_url: String,
}

impl PluginContext {
    pub fn new(
        repository: Repository,
        storage: Arc<dyn Storage>,
        db: Arc<dyn Database>,
        cache: Arc<ProxyCache>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            storage,
            db,
            cache,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Same repository, rendered under another URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Upstream base URL without a trailing slash (proxy only)
    pub fn upstream_url(&self) -> Result<&str, PluginError> {
        self.repository
            .config
            .upstream_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .ok_or_else(|| {
                PluginError::Unsupported(format!(
                    "repository '{}' has no upstream",
                    self.repository.name
                ))
            })
    }

    /// `{upstream}/{path}`
    pub fn upstream_join(&self, path: &str) -> Result<String, PluginError> {
        Ok(format!("{}/{}", self.upstream_url()?, path.trim_start_matches('/')))
    }

    pub fn is_proxy(&self) -> bool {
        self.repository.repo_type == RepositoryType::Proxy
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("repository", &self.repository.name)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Response from a registry plugin
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryResponse {
    /// HTTP status code
    pub status: u16,

    /// Response headers
    pub headers: Vec<(String, String)>,

    /// Response body
    pub body: Bytes,

    /// Content type
    pub content_type: String,
}

impl RegistryResponse {
    /// Create a new response
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            content_type: "application/octet-stream".to_string(),
        }
    }

    /// Create a successful response
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, body)
    }

    /// A JSON document
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string()).with_content_type("application/json")
    }

    /// Bytes of a stored artifact
    pub fn artifact(artifact: &Artifact, body: Bytes) -> Self {
        Self::ok(body)
            .with_content_type(artifact.content_type.clone())
            .with_header("ETag", format!("\"{}\"", artifact.content_hash))
    }

    /// Bytes served by the proxy cache
    pub fn cached(cached: CachedResponse) -> Self {
        let content_type = cached
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Self::ok(cached.body)
            .with_content_type(content_type)
            .with_header("X-Cache", cached.source.as_str())
            .with_header("X-Content-Digest", cached.digest.to_string())
    }

    /// Set the content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header with this name, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    /// Reply to a HEAD request: same headers, declared length, no body
    pub fn head(mut self) -> Self {
        if self.header("content-length").is_none() {
            self.headers
                .push(("Content-Length".to_string(), self.body.len().to_string()));
        }
        self.body = Bytes::new();
        self
    }
}

impl IntoResponse for RegistryResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Body::from(self.body)).into_response();
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&self.content_type) {
            headers.insert(axum::http::header::CONTENT_TYPE, value);
        }
        for (name, value) in &self.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                continue;
            };
            headers.insert(name, value);
        }
        response
    }
}

/// Case-insensitive lookup in a header list
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// One file to store
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    /// Package name, canonicalised by the plugin
    pub name: String,

    /// Version, tag or digest
    pub version: String,

    /// File name within the version
    pub path: String,

    /// The bytes
    pub body: Bytes,

    /// MIME type recorded for downloads
    pub content_type: String,

    /// Ecosystem metadata stored on the row
    pub metadata: serde_json::Value,

    /// Build provenance
    pub provenance: Option<Provenance>,

    /// Digest the client asserts the bytes hash to
    pub expected_digest: Option<ContentDigest>,

    /// Replace an existing file even when redeploy is disabled (tags, snapshots)
    pub mutable: bool,
}

impl UploadRequest {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        path: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            path: path.into(),
            body: body.into(),
            content_type: "application/octet-stream".to_string(),
            metadata: serde_json::Value::Null,
            provenance: None,
            expected_digest: None,
            mutable: false,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_expected_digest(mut self, digest: ContentDigest) -> Self {
        self.expected_digest = Some(digest);
        self
    }

    pub fn mutable(mut self) -> Self {
        self.mutable = true;
        self
    }
}

/// Credentials presented through an ecosystem-native login flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Result of an ecosystem-native login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub principal: Principal,
    /// Credential the client should store, when the flow issues one
    pub token: Option<String>,
}

/// Native request the plugin handles itself instead of upload/download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeMethod {
    Get,
    Put,
    Post,
    Delete,
}

/// Trait for registry plugins
///
/// Paths are relative to the repository root and carry no leading slash.
/// Implementations hold no per-repository state, so one instance serves any
/// number of repositories concurrently.
#[async_trait]
pub trait RegistryPlugin: Send + Sync {
    /// Ecosystem handled
    fn manager(&self) -> Manager;

    /// Repository types this plugin supports
    fn capabilities(&self) -> &'static [RepositoryType] {
        &[
            RepositoryType::Hosted,
            RepositoryType::Proxy,
            RepositoryType::Group,
        ]
    }

    /// JSON schema of `config.extra` for this ecosystem
    fn config_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    /// Canonical form of a package name
    fn canonical_name(&self, name: &str) -> String {
        name.to_string()
    }

    /// Turn a native publish request into files to store
    ///
    /// An empty result means the request was accepted and needs no storage
    /// (checksum sidecars, metadata the server renders itself).
    fn parse_upload(
        &self,
        path: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Vec<UploadRequest>, PluginError>;

    /// Response sent after a native publish
    fn upload_response(&self, _stored: &[Artifact]) -> RegistryResponse {
        RegistryResponse::new(201, Bytes::new())
    }

    /// Store one file in a hosted repository
    async fn upload(&self, ctx: &PluginContext, req: UploadRequest) -> Result<Artifact, PluginError> {
        hosted::hosted_upload(ctx, req).await
    }

    /// Serve a path of a hosted repository; `Ok(None)` when absent
    async fn download(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError>;

    /// Versions of a package, ascending
    async fn list_versions(&self, ctx: &PluginContext, name: &str) -> Result<Vec<String>, PluginError> {
        if ctx.is_proxy() {
            return self.proxy_versions(ctx, name).await;
        }
        let artifacts = ctx
            .db
            .list_artifacts(&ctx.repository.id, &self.canonical_name(name))
            .await?;
        Ok(version::sorted_distinct(
            artifacts.iter().map(|a| a.version.as_str()),
        ))
    }

    /// Versions the upstream index advertises
    async fn proxy_versions(&self, _ctx: &PluginContext, _name: &str) -> Result<Vec<String>, PluginError> {
        Err(PluginError::Unsupported(format!(
            "{} proxies cannot list versions",
            self.manager()
        )))
    }

    /// Package summary with per-version facts
    async fn get_package_details(
        &self,
        ctx: &PluginContext,
        name: &str,
    ) -> Result<PackageDetails, PluginError> {
        let name = self.canonical_name(name);
        if ctx.is_proxy() {
            let versions = self.proxy_versions(ctx, &name).await?;
            if versions.is_empty() {
                return Err(PluginError::NotFound(name));
            }
            let latest = version::latest(versions.iter().map(String::as_str));
            return Ok(PackageDetails::from_versions(&name, versions, latest));
        }

        let artifacts = ctx.db.list_artifacts(&ctx.repository.id, &name).await?;
        if artifacts.is_empty() {
            return Err(PluginError::NotFound(name));
        }
        let latest = version::latest(artifacts.iter().map(|a| a.version.as_str()));
        Ok(PackageDetails::from_artifacts(&name, &artifacts, latest))
    }

    /// Remove every file of a version
    async fn delete_package_version(
        &self,
        ctx: &PluginContext,
        name: &str,
        version: &str,
    ) -> Result<Vec<Artifact>, PluginError> {
        hosted::hosted_delete(ctx, &self.canonical_name(name), version).await
    }

    /// Which upstream resource a proxied path maps to, if any
    fn upstream_request(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<UpstreamRequest>, PluginError>;

    /// Adjust a proxied document so its links resolve through this repository
    fn rewrite_proxied(
        &self,
        ctx: &PluginContext,
        req: &UpstreamRequest,
        response: RegistryResponse,
    ) -> Result<RegistryResponse, PluginError> {
        if req.addressing == Addressing::Immutable {
            return Ok(response);
        }
        let upstream = ctx.upstream_url()?;
        Ok(hosted::rewrite_urls(response, upstream, &ctx.base_url))
    }

    /// Serve a path of a proxy repository through the cache
    async fn proxy_fetch(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let Some(req) = self.upstream_request(ctx, path)? else {
            return Ok(None);
        };
        match ctx.cache.fetch(&ctx.repository, &req).await? {
            Some(cached) => Ok(Some(self.rewrite_proxied(
                ctx,
                &req,
                RegistryResponse::cached(cached),
            )?)),
            None => Ok(None),
        }
    }

    /// `(name, version)` a native DELETE removes
    fn parse_delete(&self, _path: &str) -> Option<(String, String)> {
        None
    }

    /// Requests outside upload/download/delete (dist-tag edits, yanks...)
    ///
    /// `Ok(None)` means the path is not a native action of this ecosystem.
    async fn native_action(
        &self,
        _ctx: &PluginContext,
        _method: NativeMethod,
        _path: &str,
        _body: &Bytes,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        Ok(None)
    }

    /// Credentials carried by an ecosystem-native login request
    fn parse_login(&self, _path: &str, _body: &Bytes) -> Option<LoginRequest> {
        None
    }

    /// Verify a native login
    async fn authenticate(
        &self,
        auth: &AuthManager,
        login: LoginRequest,
    ) -> Result<LoginResponse, PluginError> {
        let principal = auth
            .validate_basic_auth(&login.username, &login.password, None)
            .await?;
        Ok(LoginResponse {
            principal,
            token: None,
        })
    }

    /// Render the response for a successful native login
    fn login_response(&self, _login: &LoginResponse) -> RegistryResponse {
        RegistryResponse::json(200, &serde_json::json!({ "ok": true }))
    }

    /// Check that the upstream of a proxy repository answers
    async fn ping_upstream(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        let url = ctx.upstream_url()?;
        ctx.cache
            .upstream()
            .ping(url)
            .await
            .map_err(|e| PluginError::Cache(e.into()))
    }

    /// Bring up the repository's own listener, returning its bound port
    async fn start_registry_for_repo(&self, repo: &Repository) -> Result<u16, PluginError> {
        Err(PluginError::Unsupported(format!(
            "{} repositories have no listener ({})",
            self.manager(),
            repo.name
        )))
    }

    /// Tear down the repository's listener
    async fn stop_registry_for_repo(&self, repository_id: &str) -> Result<(), PluginError> {
        Err(PluginError::Unsupported(format!(
            "{} repositories have no listener ({})",
            self.manager(),
            repository_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: RegistryResponse creation with status and body
    #[test]
    fn test_registry_response_new() {
        let resp = RegistryResponse::new(200, "Hello");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, Bytes::from("Hello"));
        assert_eq!(resp.content_type, "application/octet-stream");
    }

    // Test 2: JSON helper sets the content type
    #[test]
    fn test_registry_response_json() {
        let resp = RegistryResponse::json(201, &serde_json::json!({"ok": true}));
        assert_eq!(resp.status, 201);
        assert_eq!(resp.content_type, "application/json");
        assert_eq!(resp.body, Bytes::from(r#"{"ok":true}"#));
    }

    // Test 3: Header lookup is case-insensitive
    #[test]
    fn test_registry_response_headers() {
        let resp = RegistryResponse::ok("test")
            .with_header("Docker-Content-Digest", "sha256:aa")
            .with_header("Cache-Control", "no-cache");

        assert_eq!(resp.headers.len(), 2);
        assert_eq!(resp.header("docker-content-digest"), Some("sha256:aa"));
        assert_eq!(resp.header("x-missing"), None);
    }

    // Test 4: Upload request builder
    #[test]
    fn test_upload_request_builder() {
        let digest = ContentDigest::compute(b"x");
        let req = UploadRequest::new("pkg", "1.0.0", "pkg-1.0.0.tgz", "x")
            .with_content_type("application/gzip")
            .with_expected_digest(digest)
            .mutable();
        assert!(req.mutable);
        assert_eq!(req.expected_digest, Some(digest));
        assert_eq!(req.content_type, "application/gzip");
        assert!(req.provenance.is_none());
    }

    // Test 5: HEAD replies keep the length and drop the body
    #[test]
    fn test_head_and_into_response() {
        let resp = RegistryResponse::ok("12345")
            .with_content_type("text/plain")
            .with_header("Docker-Content-Digest", "sha256:aa")
            .head();
        assert!(resp.body.is_empty());
        assert_eq!(resp.header("content-length"), Some("5"));

        let http = resp.into_response();
        assert_eq!(http.status(), StatusCode::OK);
        assert_eq!(http.headers()["content-type"], "text/plain");
        assert_eq!(http.headers()["docker-content-digest"], "sha256:aa");
        assert_eq!(http.headers()["content-length"], "5");
    }

    // Test 6: RegistryPlugin trait is object-safe
    #[test]
    fn test_registry_plugin_is_object_safe() {
        fn _takes_plugin(_: &dyn RegistryPlugin) {}
    }
}
