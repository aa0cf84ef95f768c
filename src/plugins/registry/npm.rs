//! npm registry plugin
//!
//! npm registry API:
//! - Package metadata (packument): GET /{package}
//! - Scoped package metadata: GET /@{scope}%2F{package} or GET /@{scope}/{package}
//! - One version: GET /{package}/{version-or-tag}
//! - Tarball: GET /{package}/-/{package}-{version}.tgz
//! - Scoped tarball: GET /@{scope}/{package}/-/{package}-{version}.tgz
//! - Publish: PUT /{package} with the version manifest and a base64 attachment
//! - Dist tags: GET /-/package/{package}/dist-tags, PUT/DELETE .../dist-tags/{tag}
//! - Login: PUT /-/user/org.couchdb.user:{name}

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::auth::AuthManager;
use crate::digest::{sha1_hex, sha512_integrity};
use crate::error::{ParseError, PluginError};
use crate::models::{Artifact, CreateTokenRequest, Manager};
use crate::plugins::cache::{Addressing, UpstreamRequest};

use super::hosted;
use super::traits::{
    LoginRequest, LoginResponse, NativeMethod, PluginContext, RegistryPlugin, RegistryResponse,
    UploadRequest,
};
use super::version;

const LOGIN_PREFIX: &str = "-/user/org.couchdb.user:";
const DIST_TAGS_PREFIX: &str = "-/package/";
const LATEST: &str = "latest";

/// A request path split into the package name and what follows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagePath {
    pub name: String,
    pub rest: Vec<String>,
}

fn decode_segment(raw: &str) -> String {
    raw.replace("%2F", "/")
        .replace("%2f", "/")
        .replace("%40", "@")
}

/// Parse package name from path (handles scoped packages)
///
/// Examples:
/// - lodash -> lodash
/// - @types/node -> @types/node
/// - @types%2Fnode/-/node-18.0.0.tgz -> @types/node, ["-", "node-18.0.0.tgz"]
pub fn parse_package_path(path: &str) -> Result<PackagePath, ParseError> {
    let path = decode_segment(path.trim_matches('/'));
    if path.is_empty() {
        return Err(ParseError::MissingParameter("package name".to_string()));
    }
    let mut segments = path.split('/').map(String::from);
    let first = segments.next().unwrap_or_default();

    let name = if first.starts_with('@') {
        let package = segments
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ParseError::InvalidPath(format!("Invalid scoped package: {}", path)))?;
        format!("{}/{}", first, package)
    } else {
        first
    };
    Ok(PackagePath {
        name,
        rest: segments.collect(),
    })
}

/// URL form of a package name, scope separator escaped
pub fn encode_name(name: &str) -> String {
    name.replacen('/', "%2f", 1)
}

/// Package name without its scope
fn bare_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Extract version from tarball filename `{name}-{version}.tgz`
pub fn parse_version_from_filename(package: &str, filename: &str) -> Result<String, ParseError> {
    let base = filename
        .strip_suffix(".tgz")
        .ok_or_else(|| ParseError::InvalidPath("Expected .tgz extension".to_string()))?;
    let prefix = format!("{}-", bare_name(package));
    base.strip_prefix(&prefix)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            ParseError::InvalidPath(format!(
                "Filename {} doesn't match package {}",
                filename, package
            ))
        })
}

fn tarball_url(base_url: &str, name: &str, file: &str) -> String {
    format!("{}/{}/-/{}", base_url, name, file)
}

fn stored_tags(artifact: &Artifact) -> Vec<String> {
    artifact.metadata["dist_tags"]
        .as_array()
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// `dist-tags` of a package: `latest` is the highest release, other tags as published
pub fn dist_tags(artifacts: &[Artifact]) -> Map<String, Value> {
    let mut tags = Map::new();
    if let Some(latest) = version::latest(artifacts.iter().map(|a| a.version.as_str())) {
        tags.insert(LATEST.to_string(), Value::String(latest));
    }
    for artifact in artifacts {
        for tag in stored_tags(artifact) {
            if tag != LATEST {
                tags.insert(tag, Value::String(artifact.version.clone()));
            }
        }
    }
    tags
}

/// Manifest of one version with `dist` pointing at this repository
fn version_document(base_url: &str, artifact: &Artifact) -> Value {
    let mut manifest = match &artifact.metadata["manifest"] {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };
    manifest.insert("name".to_string(), json!(artifact.name));
    manifest.insert("version".to_string(), json!(artifact.version));
    manifest.insert(
        "dist".to_string(),
        json!({
            "tarball": tarball_url(base_url, &artifact.name, &artifact.path),
            "shasum": artifact.metadata["dist"]["shasum"],
            "integrity": artifact.metadata["dist"]["integrity"],
        }),
    );
    Value::Object(manifest)
}

/// The packument served for `GET /{package}`
pub fn render_packument(base_url: &str, name: &str, artifacts: &[Artifact]) -> Value {
    let mut versions = Map::new();
    let mut time = Map::new();
    for artifact in artifacts {
        versions.insert(artifact.version.clone(), version_document(base_url, artifact));
        time.insert(artifact.version.clone(), json!(artifact.created_at.to_rfc3339()));
    }
    if let Some(first) = artifacts.iter().map(|a| a.created_at).min() {
        time.insert("created".to_string(), json!(first.to_rfc3339()));
    }
    if let Some(last) = artifacts.iter().map(|a| a.created_at).max() {
        time.insert("modified".to_string(), json!(last.to_rfc3339()));
    }

    json!({
        "_id": name,
        "name": name,
        "dist-tags": dist_tags(artifacts),
        "versions": versions,
        "time": time,
    })
}

/// npm registry plugin
#[derive(Debug, Default)]
pub struct NpmPlugin;

impl NpmPlugin {
    pub fn new() -> Self {
        Self
    }

    /// Decode a publish document into one upload per attachment
    fn parse_publish(&self, path: &str, body: &Bytes) -> Result<Vec<UploadRequest>, PluginError> {
        let target = parse_package_path(path)?;
        let doc: Value = serde_json::from_slice(body)
            .map_err(|e| ParseError::InvalidBody(format!("publish document: {}", e)))?;

        let name = doc["name"].as_str().unwrap_or(target.name.as_str());
        if name != target.name {
            return Err(ParseError::InvalidPackageName(format!(
                "document names '{}' but was sent to '{}'",
                name, target.name
            ))
            .into());
        }

        let Some(attachments) = doc["_attachments"].as_object() else {
            // Metadata-only update (deprecations, unpublish rewrites)
            return Ok(Vec::new());
        };

        let mut uploads = Vec::new();
        for (filename, attachment) in attachments {
            let data = attachment["data"]
                .as_str()
                .ok_or_else(|| ParseError::InvalidBody(format!("attachment {} has no data", filename)))?;
            let bytes = STANDARD
                .decode(data)
                .map_err(|e| ParseError::InvalidBody(format!("attachment {}: {}", filename, e)))?;

            let file = hosted::file_name(filename).to_string();
            let version = doc["versions"]
                .as_object()
                .and_then(|versions| {
                    versions.iter().find_map(|(v, manifest)| {
                        manifest["dist"]["tarball"]
                            .as_str()
                            .is_some_and(|t| t.ends_with(&format!("/{}", file)))
                            .then(|| v.clone())
                    })
                })
                .map_or_else(|| parse_version_from_filename(name, &file), Ok)?;

            let mut manifest = doc["versions"][&version].clone();
            if !manifest.is_object() {
                return Err(ParseError::InvalidBody(format!(
                    "no manifest for version {}",
                    version
                ))
                .into());
            }

            let shasum = sha1_hex(&bytes);
            if let Some(claimed) = manifest["dist"]["shasum"].as_str() {
                if !claimed.eq_ignore_ascii_case(&shasum) {
                    return Err(PluginError::DigestMismatch {
                        expected: format!("sha1:{}", claimed),
                        actual: format!("sha1:{}", shasum),
                    });
                }
            }
            if let Some(m) = manifest.as_object_mut() {
                for key in ["dist", "_id", "_rev", "_attachments"] {
                    m.remove(key);
                }
            }

            let tags: Vec<&str> = doc["dist-tags"]
                .as_object()
                .map(|t| {
                    t.iter()
                        .filter(|(tag, v)| tag.as_str() != LATEST && v.as_str() == Some(version.as_str()))
                        .map(|(tag, _)| tag.as_str())
                        .collect()
                })
                .unwrap_or_default();

            let metadata = json!({
                "manifest": manifest,
                "dist": {
                    "shasum": shasum,
                    "integrity": sha512_integrity(&bytes),
                },
                "dist_tags": tags,
            });
            uploads.push(
                UploadRequest::new(name, version, file, bytes)
                    .with_content_type("application/octet-stream")
                    .with_metadata(metadata),
            );
        }
        Ok(uploads)
    }

    /// Point `tag` at `version`, or remove it when `version` is None
    async fn set_dist_tag(
        &self,
        ctx: &PluginContext,
        name: &str,
        tag: &str,
        version: Option<&str>,
    ) -> Result<Map<String, Value>, PluginError> {
        if tag == LATEST {
            return Err(ParseError::InvalidVersion(
                "'latest' always follows the highest release".to_string(),
            )
            .into());
        }
        let artifacts = ctx.db.list_artifacts(&ctx.repository.id, name).await?;
        if artifacts.is_empty() {
            return Err(PluginError::NotFound(name.to_string()));
        }
        if let Some(v) = version {
            if !artifacts.iter().any(|a| a.version == v) {
                return Err(PluginError::NotFound(format!("{}@{}", name, v)));
            }
        }

        for artifact in &artifacts {
            let mut tags = stored_tags(artifact);
            let had = tags.iter().any(|t| t == tag);
            tags.retain(|t| t != tag);
            let wants = Some(artifact.version.as_str()) == version;
            if wants {
                tags.push(tag.to_string());
            }
            if had != wants {
                let mut metadata = artifact.metadata.clone();
                metadata["dist_tags"] = json!(tags);
                ctx.db.update_artifact_metadata(&artifact.id, &metadata).await?;
            }
        }

        let refreshed = ctx.db.list_artifacts(&ctx.repository.id, name).await?;
        Ok(dist_tags(&refreshed))
    }
}

#[async_trait]
impl RegistryPlugin for NpmPlugin {
    fn manager(&self) -> Manager {
        Manager::Npm
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "upstream_url": { "type": "string", "default": "https://registry.npmjs.org" }
            }
        })
    }

    fn parse_upload(
        &self,
        path: &str,
        _headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Vec<UploadRequest>, PluginError> {
        if path.starts_with("-/") {
            return Err(ParseError::InvalidPath(format!("cannot publish to {}", path)).into());
        }
        self.parse_publish(path, &body)
    }

    fn upload_response(&self, _stored: &[Artifact]) -> RegistryResponse {
        RegistryResponse::json(201, &json!({ "ok": true, "success": true }))
    }

    async fn download(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        if let Some(rest) = path.strip_prefix(DIST_TAGS_PREFIX) {
            let Some(pkg) = rest.strip_suffix("/dist-tags") else {
                return Ok(None);
            };
            let name = parse_package_path(pkg)?.name;
            let artifacts = ctx.db.list_artifacts(&ctx.repository.id, &name).await?;
            if artifacts.is_empty() {
                return Ok(None);
            }
            return Ok(Some(RegistryResponse::json(
                200,
                &Value::Object(dist_tags(&artifacts)),
            )));
        }
        if path.starts_with("-/") {
            return Ok(None);
        }

        let target = parse_package_path(path)?;
        let artifacts = ctx
            .db
            .list_artifacts(&ctx.repository.id, &target.name)
            .await?;
        if artifacts.is_empty() {
            return Ok(None);
        }

        match target.rest.as_slice() {
            [] => Ok(Some(RegistryResponse::json(
                200,
                &render_packument(&ctx.base_url, &target.name, &artifacts),
            ))),
            [dash, file] if dash == "-" => {
                let Some(artifact) = artifacts.iter().find(|a| &a.path == file) else {
                    return Ok(None);
                };
                Ok(hosted::load(ctx, artifact)
                    .await?
                    .map(|body| RegistryResponse::artifact(artifact, body)))
            }
            [reference] => {
                let tags = dist_tags(&artifacts);
                let wanted = tags
                    .get(reference)
                    .and_then(Value::as_str)
                    .unwrap_or(reference.as_str());
                Ok(artifacts
                    .iter()
                    .find(|a| a.version == wanted)
                    .map(|a| RegistryResponse::json(200, &version_document(&ctx.base_url, a))))
            }
            _ => Ok(None),
        }
    }

    async fn proxy_versions(&self, ctx: &PluginContext, name: &str) -> Result<Vec<String>, PluginError> {
        let Some(packument) = self.proxy_fetch(ctx, &encode_name(name)).await? else {
            return Ok(Vec::new());
        };
        let doc: Value = serde_json::from_slice(&packument.body)
            .map_err(|e| PluginError::Serialization(format!("upstream packument: {}", e)))?;
        Ok(version::sorted_distinct(
            doc["versions"]
                .as_object()
                .map(|v| v.keys().map(String::as_str).collect::<Vec<_>>())
                .unwrap_or_default(),
        ))
    }

    fn upstream_request(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<UpstreamRequest>, PluginError> {
        if path.starts_with(LOGIN_PREFIX) || path == "-/whoami" {
            return Ok(None);
        }
        if path.starts_with(DIST_TAGS_PREFIX) {
            let url = ctx.upstream_join(path)?;
            return Ok(Some(UpstreamRequest::new(path, url, Addressing::Mutable)));
        }

        let target = parse_package_path(path)?;
        match target.rest.as_slice() {
            // Tarballs are version-addressed and never change once published
            [dash, file] if dash == "-" => {
                let key = format!("{}/-/{}", target.name, file);
                let url = ctx.upstream_join(&key)?;
                Ok(Some(UpstreamRequest::new(key, url, Addressing::Immutable)))
            }
            rest => {
                let mut key = encode_name(&target.name);
                for segment in rest {
                    key.push('/');
                    key.push_str(segment);
                }
                let url = ctx.upstream_join(&key)?;
                Ok(Some(
                    UpstreamRequest::new(key, url, Addressing::Mutable)
                        .with_accept(["application/json"]),
                ))
            }
        }
    }

    fn parse_delete(&self, path: &str) -> Option<(String, String)> {
        let target = parse_package_path(path).ok()?;
        match target.rest.as_slice() {
            [dash, file, ..] if dash == "-" => {
                let version = parse_version_from_filename(&target.name, file).ok()?;
                Some((target.name, version))
            }
            _ => None,
        }
    }

    async fn native_action(
        &self,
        ctx: &PluginContext,
        method: NativeMethod,
        path: &str,
        body: &Bytes,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let Some(rest) = path.strip_prefix(DIST_TAGS_PREFIX) else {
            return Ok(None);
        };
        let Some((pkg, tag)) = rest.rsplit_once("/dist-tags/") else {
            return Ok(None);
        };
        let name = parse_package_path(pkg)?.name;

        let tags = match method {
            NativeMethod::Put | NativeMethod::Post => {
                let version: String = serde_json::from_slice(body)
                    .map_err(|e| ParseError::InvalidBody(format!("dist-tag version: {}", e)))?;
                self.set_dist_tag(ctx, &name, tag, Some(&version)).await?
            }
            NativeMethod::Delete => self.set_dist_tag(ctx, &name, tag, None).await?,
            NativeMethod::Get => return Ok(None),
        };
        Ok(Some(RegistryResponse::json(200, &Value::Object(tags))))
    }

    fn parse_login(&self, path: &str, body: &Bytes) -> Option<LoginRequest> {
        let user = path.strip_prefix(LOGIN_PREFIX)?;
        let doc: Value = serde_json::from_slice(body).ok()?;
        Some(LoginRequest {
            username: doc["name"].as_str().unwrap_or(user).to_string(),
            password: doc["password"].as_str()?.to_string(),
        })
    }

    /// Log in and issue an API token for the npm client to store
    async fn authenticate(
        &self,
        auth: &AuthManager,
        login: LoginRequest,
    ) -> Result<LoginResponse, PluginError> {
        let principal = auth
            .validate_basic_auth(&login.username, &login.password, None)
            .await?;
        let issued = auth
            .create_token(CreateTokenRequest {
                name: format!("npm login ({})", login.username),
                principal: principal.name.clone(),
                expires_at: None,
            })
            .await?;
        Ok(LoginResponse {
            principal,
            token: Some(issued.token),
        })
    }

    fn login_response(&self, login: &LoginResponse) -> RegistryResponse {
        RegistryResponse::json(
            201,
            &json!({
                "ok": true,
                "id": format!("org.couchdb.user:{}", login.principal.name),
                "token": login.token,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::registry::hosted::testing::{hosted, proxy, BASE_URL};
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn publish_doc(name: &str, version: &str, tarball: &[u8], tags: Value) -> Bytes {
        let file = format!("{}-{}.tgz", bare_name(name), version);
        let doc = json!({
            "_id": name,
            "name": name,
            "dist-tags": tags,
            "versions": {
                version: {
                    "name": name,
                    "version": version,
                    "description": "demo package",
                    "dist": {
                        "tarball": format!("http://localhost/{}/-/{}", name, file),
                        "shasum": sha1_hex(tarball),
                    }
                }
            },
            "_attachments": {
                file: {
                    "content_type": "application/octet-stream",
                    "data": STANDARD.encode(tarball),
                    "length": tarball.len(),
                }
            }
        });
        Bytes::from(doc.to_string())
    }

    async fn publish(ctx: &PluginContext, plugin: &NpmPlugin, name: &str, version: &str, tags: Value) {
        let body = publish_doc(name, version, format!("tarball {}", version).as_bytes(), tags);
        for req in plugin.parse_upload(name, &[], body).unwrap() {
            plugin.upload(ctx, req).await.unwrap();
        }
    }

    // Test 1: package paths, scoped and encoded
    #[test]
    fn test_parse_package_path() {
        let p = parse_package_path("lodash").unwrap();
        assert_eq!(p.name, "lodash");
        assert!(p.rest.is_empty());

        let p = parse_package_path("@types%2Fnode").unwrap();
        assert_eq!(p.name, "@types/node");

        let p = parse_package_path("@types/node/-/node-18.0.0.tgz").unwrap();
        assert_eq!(p.name, "@types/node");
        assert_eq!(p.rest, vec!["-", "node-18.0.0.tgz"]);

        assert!(parse_package_path("").is_err());
        assert!(parse_package_path("@scope").is_err());
    }

    // Test 2: version from tarball filename
    #[test]
    fn test_parse_version_from_filename() {
        assert_eq!(
            parse_version_from_filename("lodash", "lodash-4.17.21.tgz").unwrap(),
            "4.17.21"
        );
        assert_eq!(
            parse_version_from_filename("@types/node", "node-18.0.0-beta.1.tgz").unwrap(),
            "18.0.0-beta.1"
        );
        assert!(parse_version_from_filename("lodash", "other-1.0.0.tgz").is_err());
        assert!(parse_version_from_filename("lodash", "lodash-1.0.0.zip").is_err());
    }

    // Test 3: publish, then packument shows latest and the tarball serves exact bytes
    #[tokio::test]
    async fn test_publish_and_read_back() {
        let ctx = hosted(Manager::Npm).await;
        let plugin = NpmPlugin::new();
        let tarball = b"\x1f\x8b exact tarball bytes";
        let body = publish_doc("pkg", "1.0.0", tarball, json!({"latest": "1.0.0"}));

        let uploads = plugin.parse_upload("pkg", &[], body).unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].version, "1.0.0");
        assert_eq!(uploads[0].path, "pkg-1.0.0.tgz");
        plugin.upload(&ctx, uploads[0].clone()).await.unwrap();

        let resp = plugin.download(&ctx, "pkg").await.unwrap().unwrap();
        let doc: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(doc["dist-tags"]["latest"], "1.0.0");
        assert_eq!(doc["versions"]["1.0.0"]["description"], "demo package");
        assert_eq!(
            doc["versions"]["1.0.0"]["dist"]["tarball"],
            format!("{}/pkg/-/pkg-1.0.0.tgz", BASE_URL)
        );
        assert_eq!(doc["versions"]["1.0.0"]["dist"]["shasum"], sha1_hex(tarball));

        let resp = plugin
            .download(&ctx, "pkg/-/pkg-1.0.0.tgz")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.body, Bytes::from_static(tarball));
    }

    // Test 4: pre-releases carry their own tag and never become latest
    #[tokio::test]
    async fn test_prerelease_tags() {
        let ctx = hosted(Manager::Npm).await;
        let plugin = NpmPlugin::new();
        publish(&ctx, &plugin, "pkg", "1.0.0", json!({"latest": "1.0.0"})).await;
        publish(&ctx, &plugin, "pkg", "2.0.0-beta.1", json!({"beta": "2.0.0-beta.1"})).await;

        let resp = plugin
            .download(&ctx, "-/package/pkg/dist-tags")
            .await
            .unwrap()
            .unwrap();
        let tags: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(tags, json!({"latest": "1.0.0", "beta": "2.0.0-beta.1"}));

        let resp = plugin.download(&ctx, "pkg/beta").await.unwrap().unwrap();
        let doc: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(doc["version"], "2.0.0-beta.1");
    }

    // Test 5: dist-tag edits through the native endpoint
    #[tokio::test]
    async fn test_dist_tag_edits() {
        let ctx = hosted(Manager::Npm).await;
        let plugin = NpmPlugin::new();
        publish(&ctx, &plugin, "@acme/ui", "1.0.0", json!({})).await;
        publish(&ctx, &plugin, "@acme/ui", "1.1.0", json!({})).await;

        let resp = plugin
            .native_action(
                &ctx,
                NativeMethod::Put,
                "-/package/@acme%2fui/dist-tags/stable",
                &Bytes::from_static(b"\"1.0.0\""),
            )
            .await
            .unwrap()
            .unwrap();
        let tags: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(tags["stable"], "1.0.0");
        assert_eq!(tags["latest"], "1.1.0");

        let resp = plugin
            .native_action(
                &ctx,
                NativeMethod::Delete,
                "-/package/@acme%2fui/dist-tags/stable",
                &Bytes::new(),
            )
            .await
            .unwrap()
            .unwrap();
        let tags: Value = serde_json::from_slice(&resp.body).unwrap();
        assert!(tags.get("stable").is_none());

        let err = plugin
            .native_action(
                &ctx,
                NativeMethod::Put,
                "-/package/@acme%2fui/dist-tags/latest",
                &Bytes::from_static(b"\"1.0.0\""),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Parse(_)));
    }

    // Test 6: a shasum that does not match the attachment is rejected
    #[test]
    fn test_publish_shasum_mismatch() {
        let plugin = NpmPlugin::new();
        let mut doc: Value =
            serde_json::from_slice(&publish_doc("pkg", "1.0.0", b"abc", json!({}))).unwrap();
        doc["versions"]["1.0.0"]["dist"]["shasum"] = json!("0000");
        let err = plugin
            .parse_upload("pkg", &[], Bytes::from(doc.to_string()))
            .unwrap_err();
        assert!(matches!(err, PluginError::DigestMismatch { .. }));
    }

    // Test 7: unpublish of one tarball maps to (name, version)
    #[test]
    fn test_parse_delete() {
        let plugin = NpmPlugin::new();
        assert_eq!(
            plugin.parse_delete("pkg/-/pkg-1.0.0.tgz/-rev/3-abc"),
            Some(("pkg".to_string(), "1.0.0".to_string()))
        );
        assert_eq!(plugin.parse_delete("pkg"), None);
    }

    // Test 8: login request decoding
    #[test]
    fn test_parse_login() {
        let plugin = NpmPlugin::new();
        let body = Bytes::from(r#"{"name":"alice","password":"ad_secret"}"#);
        let login = plugin
            .parse_login("-/user/org.couchdb.user:alice", &body)
            .unwrap();
        assert_eq!(login.username, "alice");
        assert_eq!(login.password, "ad_secret");
        assert!(plugin.parse_login("pkg", &body).is_none());
    }

    // Test 9: proxied packuments are rewritten, tarballs cached once
    #[tokio::test]
    async fn test_proxy_fetch() {
        let upstream = MockServer::start().await;
        let packument = json!({
            "name": "left-pad",
            "versions": {
                "1.3.0": {
                    "dist": { "tarball": format!("{}/left-pad/-/left-pad-1.3.0.tgz", upstream.uri()) }
                }
            }
        });
        Mock::given(method("GET"))
            .and(url_path("/left-pad"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&packument))
            .expect(2)
            .mount(&upstream)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/left-pad/-/left-pad-1.3.0.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tgz".to_vec()))
            .expect(1)
            .mount(&upstream)
            .await;

        let ctx = proxy(Manager::Npm, &upstream.uri()).await;
        let plugin = NpmPlugin::new();

        let resp = plugin.proxy_fetch(&ctx, "left-pad").await.unwrap().unwrap();
        let doc: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(
            doc["versions"]["1.3.0"]["dist"]["tarball"],
            format!("{}/left-pad/-/left-pad-1.3.0.tgz", BASE_URL)
        );

        for _ in 0..2 {
            let resp = plugin
                .proxy_fetch(&ctx, "left-pad/-/left-pad-1.3.0.tgz")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(resp.body, Bytes::from_static(b"tgz"));
        }

        let versions = plugin.list_versions(&ctx, "left-pad").await.unwrap();
        assert_eq!(versions, vec!["1.3.0"]);
    }
}
