//! Container image plugin
//!
//! Speaks the registry v2 paths (`v2/{name}/manifests/{ref}`, `v2/{name}/blobs/{digest}`,
//! `v2/{name}/tags/list`) against hosted storage or the proxy cache. The
//! per-repository listeners in [`crate::container`] translate wire requests
//! into these paths.
//!
//! Hosted rows:
//! - manifest by tag: `(name, tag, "manifest")`
//! - manifest by digest: `(name, digest, "manifest")`
//! - blob: `(name, digest, "blob")`

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::container::ListenerManager;
use crate::digest::{is_digest_reference, ContentDigest};
use crate::error::{ParseError, PluginError};
use crate::models::{Manager, PackageDetails, Repository};
use crate::plugins::cache::{Addressing, UpstreamRequest};

use super::hosted;
use super::traits::{header, PluginContext, RegistryPlugin, RegistryResponse, UploadRequest};
use super::version;

pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MANIFEST_V1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Media types accepted when pulling a manifest by tag
pub const MANIFEST_ACCEPT: [&str; 5] = [
    OCI_INDEX,
    OCI_MANIFEST,
    MANIFEST_LIST_V2,
    MANIFEST_V2,
    MANIFEST_V1_SIGNED,
];

const MANIFEST_ROW: &str = "manifest";
const BLOB_ROW: &str = "blob";

/// Registries whose single-segment names live under `library/`
const IMPLICIT_LIBRARY_HOSTS: [&str; 3] = ["registry-1.docker.io", "docker.io", "index.docker.io"];

/// A parsed registry v2 path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerPath {
    /// `v2/`
    VersionCheck,
    /// `v2/_catalog`
    Catalog,
    /// `v2/{name}/manifests/{reference}`
    Manifest { name: String, reference: String },
    /// `v2/{name}/blobs/{digest}`
    Blob { name: String, digest: String },
    /// `v2/{name}/tags/list`
    TagList { name: String },
}

/// Tag list response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagList {
    pub name: String,
    pub tags: Vec<String>,
}

/// Image names: lowercase alphanumeric components joined by `/`, separators `._-` inside
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && name.split('/').all(|component| {
            let bytes = component.as_bytes();
            !bytes.is_empty()
                && bytes[0].is_ascii_alphanumeric()
                && bytes[bytes.len() - 1].is_ascii_alphanumeric()
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        })
}

/// Parse a registry v2 path
pub fn parse_docker_path(path: &str) -> Result<DockerPath, ParseError> {
    let path = path.trim_start_matches('/');
    let path = path.strip_prefix("v2").unwrap_or(path).trim_start_matches('/');

    if path.is_empty() {
        return Ok(DockerPath::VersionCheck);
    }
    if path == "_catalog" {
        return Ok(DockerPath::Catalog);
    }

    let invalid = || ParseError::InvalidPath(format!("invalid registry path: {}", path));
    let checked = |name: &str| -> Result<String, ParseError> {
        if is_valid_name(name) {
            Ok(name.to_string())
        } else {
            Err(ParseError::InvalidPackageName(name.to_string()))
        }
    };

    if let Some(name) = path.strip_suffix("/tags/list") {
        return Ok(DockerPath::TagList { name: checked(name)? });
    }
    if let Some(pos) = path.rfind("/manifests/") {
        let reference = &path[pos + "/manifests/".len()..];
        if reference.is_empty() || reference.contains('/') {
            return Err(invalid());
        }
        return Ok(DockerPath::Manifest {
            name: checked(&path[..pos])?,
            reference: reference.to_string(),
        });
    }
    if let Some(pos) = path.rfind("/blobs/") {
        let digest = &path[pos + "/blobs/".len()..];
        if !is_digest_reference(digest) {
            return Err(invalid());
        }
        return Ok(DockerPath::Blob {
            name: checked(&path[..pos])?,
            digest: digest.to_string(),
        });
    }
    Err(invalid())
}

/// Media type of a manifest body, preferring its own `mediaType`
pub fn detect_media_type(body: &[u8], content_type: Option<&str>) -> Result<String, ParseError> {
    let doc: Value = serde_json::from_slice(body)
        .map_err(|e| ParseError::InvalidBody(format!("manifest is not JSON: {}", e)))?;
    if let Some(declared) = doc["mediaType"].as_str() {
        return Ok(declared.to_string());
    }
    if let Some(ct) = content_type.map(|c| c.split(';').next().unwrap_or(c).trim()) {
        if MANIFEST_ACCEPT.contains(&ct) {
            return Ok(ct.to_string());
        }
    }
    Ok(match doc["schemaVersion"].as_u64() {
        Some(1) => MANIFEST_V1_SIGNED.to_string(),
        _ if doc.get("manifests").is_some() => OCI_INDEX.to_string(),
        _ => OCI_MANIFEST.to_string(),
    })
}

/// Parse a `sha256:` reference
pub fn parse_digest(reference: &str) -> Result<ContentDigest, ParseError> {
    reference.parse()
}

/// Upstream name for an image, adding the implicit namespace of Docker-Hub-style registries
pub fn upstream_name(repo: &Repository, name: &str) -> String {
    if name.contains('/') {
        return name.to_string();
    }
    let configured = repo
        .config
        .extra
        .get("implicit_namespace")
        .and_then(Value::as_str)
        .map(String::from);
    let namespace = configured.or_else(|| {
        let upstream = repo.config.upstream_url.as_deref()?;
        let host = upstream
            .split("://")
            .nth(1)
            .unwrap_or(upstream)
            .split(['/', ':'])
            .next()?;
        IMPLICIT_LIBRARY_HOSTS
            .contains(&host)
            .then(|| "library".to_string())
    });
    match namespace.filter(|n| !n.is_empty()) {
        Some(ns) => format!("{}/{}", ns.trim_end_matches('/'), name),
        None => name.to_string(),
    }
}

/// Base URL of the upstream registry API; `docker.io` serves its API elsewhere
fn upstream_base(ctx: &PluginContext) -> Result<String, PluginError> {
    let upstream = ctx.upstream_url()?;
    let host = upstream.split("://").nth(1).unwrap_or(upstream);
    if host == "docker.io" || host == "index.docker.io" {
        return Ok("https://registry-1.docker.io".to_string());
    }
    Ok(upstream.to_string())
}

/// Container image plugin
#[derive(Default)]
pub struct DockerPlugin {
    listeners: Option<Arc<ListenerManager>>,
}

impl std::fmt::Debug for DockerPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerPlugin")
            .field("listeners", &self.listeners.is_some())
            .finish()
    }
}

impl DockerPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugin able to start and stop per-repository listeners
    pub fn with_listeners(listeners: Arc<ListenerManager>) -> Self {
        Self {
            listeners: Some(listeners),
        }
    }

    fn listeners(&self) -> Result<&Arc<ListenerManager>, PluginError> {
        self.listeners
            .as_ref()
            .ok_or_else(|| PluginError::Unsupported("registry listeners are not configured".to_string()))
    }

    async fn tags(&self, ctx: &PluginContext, name: &str) -> Result<Vec<String>, PluginError> {
        let artifacts = ctx.db.list_artifacts(&ctx.repository.id, name).await?;
        let mut tags: Vec<String> = artifacts
            .into_iter()
            .filter(|a| a.path == MANIFEST_ROW && !is_digest_reference(&a.version))
            .map(|a| a.version)
            .collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    async fn serve_manifest(
        &self,
        ctx: &PluginContext,
        name: &str,
        reference: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let Some(artifact) = ctx
            .db
            .get_artifact(&ctx.repository.id, name, reference, MANIFEST_ROW)
            .await?
        else {
            return Ok(None);
        };
        let Some(body) = hosted::load(ctx, &artifact).await? else {
            return Ok(None);
        };
        let digest = artifact.metadata["digest"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| format!("sha256:{}", artifact.content_hash));
        Ok(Some(
            RegistryResponse::ok(body)
                .with_content_type(artifact.content_type.clone())
                .with_header("Docker-Content-Digest", digest),
        ))
    }

    fn manifest_uploads(
        name: &str,
        reference: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Vec<UploadRequest>, PluginError> {
        let media_type = detect_media_type(&body, header(headers, "content-type"))?;
        let digest = ContentDigest::compute(&body);
        if is_digest_reference(reference) && parse_digest(reference)? != digest {
            return Err(PluginError::DigestMismatch {
                expected: reference.to_string(),
                actual: digest.to_string(),
            });
        }
        let metadata = json!({ "media_type": media_type, "digest": digest.to_string() });
        let row = |version: &str| {
            UploadRequest::new(name, version, MANIFEST_ROW, body.clone())
                .with_content_type(media_type.clone())
                .with_metadata(metadata.clone())
                .with_expected_digest(digest)
                .mutable()
        };

        let mut uploads = Vec::with_capacity(2);
        if !is_digest_reference(reference) {
            uploads.push(row(reference));
        }
        uploads.push(row(&digest.to_string()));
        Ok(uploads)
    }
}

#[async_trait]
impl RegistryPlugin for DockerPlugin {
    fn manager(&self) -> Manager {
        Manager::Docker
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "registry": {
                    "type": "object",
                    "properties": {
                        "port": { "type": ["integer", "null"], "minimum": 0, "maximum": 65535 },
                        "protocol_version": { "type": "string", "enum": ["registry/2.0"] }
                    }
                },
                "implicit_namespace": { "type": "string" }
            }
        })
    }

    fn parse_upload(
        &self,
        path: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Vec<UploadRequest>, PluginError> {
        match parse_docker_path(path)? {
            DockerPath::Manifest { name, reference } => {
                Self::manifest_uploads(&name, &reference, headers, body)
            }
            DockerPath::Blob { name, digest } => {
                let expected = parse_digest(&digest)?;
                Ok(vec![UploadRequest::new(name, digest, BLOB_ROW, body)
                    .with_content_type("application/octet-stream")
                    .with_expected_digest(expected)
                    .mutable()])
            }
            _ => Err(ParseError::InvalidPath(format!("cannot push to {}", path)).into()),
        }
    }

    fn upload_response(&self, stored: &[crate::models::Artifact]) -> RegistryResponse {
        let Some(last) = stored.last() else {
            return RegistryResponse::new(201, Bytes::new());
        };
        let digest = format!("sha256:{}", last.content_hash);
        let kind = if last.path == BLOB_ROW { "blobs" } else { "manifests" };
        RegistryResponse::new(201, Bytes::new())
            .with_header("Location", format!("/v2/{}/{}/{}", last.name, kind, digest))
            .with_header("Docker-Content-Digest", digest)
    }

    async fn download(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        match parse_docker_path(path)? {
            DockerPath::VersionCheck => Ok(Some(RegistryResponse::json(200, &json!({})))),
            DockerPath::Catalog => {
                let names = ctx.db.list_package_names(&ctx.repository.id).await?;
                Ok(Some(RegistryResponse::json(200, &json!({ "repositories": names }))))
            }
            DockerPath::Manifest { name, reference } => {
                self.serve_manifest(ctx, &name, &reference).await
            }
            DockerPath::Blob { name, digest } => {
                let resp = hosted::serve_file(ctx, &name, &digest, BLOB_ROW).await?;
                Ok(resp.map(|r| r.with_header("Docker-Content-Digest", digest)))
            }
            DockerPath::TagList { name } => {
                let tags = self.tags(ctx, &name).await?;
                if tags.is_empty() {
                    return Ok(None);
                }
                let list = TagList { name, tags };
                let value = serde_json::to_value(&list)
                    .map_err(|e| PluginError::Serialization(e.to_string()))?;
                Ok(Some(RegistryResponse::json(200, &value)))
            }
        }
    }

    async fn list_versions(&self, ctx: &PluginContext, name: &str) -> Result<Vec<String>, PluginError> {
        if ctx.is_proxy() {
            return self.proxy_versions(ctx, name).await;
        }
        self.tags(ctx, name).await
    }

    async fn proxy_versions(&self, ctx: &PluginContext, name: &str) -> Result<Vec<String>, PluginError> {
        let Some(resp) = self.proxy_fetch(ctx, &format!("v2/{}/tags/list", name)).await? else {
            return Ok(Vec::new());
        };
        let list: TagList = serde_json::from_slice(&resp.body)
            .map_err(|e| PluginError::Serialization(format!("upstream tag list: {}", e)))?;
        let mut tags = list.tags;
        tags.sort();
        Ok(tags)
    }

    async fn get_package_details(
        &self,
        ctx: &PluginContext,
        name: &str,
    ) -> Result<PackageDetails, PluginError> {
        let tags = self.list_versions(ctx, name).await?;
        if tags.is_empty() {
            return Err(PluginError::NotFound(name.to_string()));
        }
        let latest = tags
            .iter()
            .any(|t| t == "latest")
            .then(|| "latest".to_string())
            .or_else(|| version::latest(tags.iter().map(String::as_str)));
        Ok(PackageDetails::from_versions(name, tags, latest))
    }

    fn upstream_request(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<UpstreamRequest>, PluginError> {
        let base = upstream_base(ctx)?;
        let request = match parse_docker_path(path)? {
            DockerPath::Manifest { name, reference } => {
                let remote = upstream_name(&ctx.repository, &name);
                let url = format!("{}/v2/{}/manifests/{}", base, remote, reference);
                if is_digest_reference(&reference) {
                    UpstreamRequest::by_digest(parse_digest(&reference)?, url)
                        .with_accept(MANIFEST_ACCEPT)
                } else {
                    UpstreamRequest::new(
                        format!("v2/{}/manifests/{}", remote, reference),
                        url,
                        Addressing::Mutable,
                    )
                    .with_accept(MANIFEST_ACCEPT)
                }
            }
            DockerPath::Blob { name, digest } => {
                let remote = upstream_name(&ctx.repository, &name);
                let url = format!("{}/v2/{}/blobs/{}", base, remote, digest);
                UpstreamRequest::by_digest(parse_digest(&digest)?, url)
            }
            DockerPath::TagList { name } => {
                let remote = upstream_name(&ctx.repository, &name);
                let key = format!("v2/{}/tags/list", remote);
                let url = format!("{}/{}", base, key);
                UpstreamRequest::new(key, url, Addressing::Mutable).with_accept(["application/json"])
            }
            DockerPath::VersionCheck | DockerPath::Catalog => return Ok(None),
        };
        Ok(Some(request))
    }

    async fn proxy_fetch(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        if parse_docker_path(path)? == DockerPath::VersionCheck {
            return Ok(Some(RegistryResponse::json(200, &json!({}))));
        }
        let Some(req) = self.upstream_request(ctx, path)? else {
            return Ok(None);
        };
        Ok(ctx
            .cache
            .fetch(&ctx.repository, &req)
            .await?
            .map(|cached| {
                let digest = cached.digest.to_string();
                RegistryResponse::cached(cached).with_header("Docker-Content-Digest", digest)
            }))
    }

    fn parse_delete(&self, path: &str) -> Option<(String, String)> {
        match parse_docker_path(path).ok()? {
            DockerPath::Manifest { name, reference } => Some((name, reference)),
            _ => None,
        }
    }

    async fn start_registry_for_repo(&self, repo: &Repository) -> Result<u16, PluginError> {
        self.listeners()?.start(repo).await
    }

    async fn stop_registry_for_repo(&self, repository_id: &str) -> Result<(), PluginError> {
        self.listeners()?.stop(repository_id).await
    }
}
