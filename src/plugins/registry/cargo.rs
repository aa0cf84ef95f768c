//! Cargo registry plugin
//!
//! Serves the sparse index protocol and the publish/yank web API:
//! - `config.json`
//! - index files at the sharded path of each crate (`1/a`, `3/a/abc`, `se/rd/serde`)
//! - PUT `api/v1/crates/new` in cargo's binary publish format
//! - DELETE `api/v1/crates/{name}/{version}/yank`, PUT `.../unyank`
//! - GET `api/v1/crates/{name}/{version}/download`

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::error::{ParseError, PluginError};
use crate::models::{Artifact, Manager};
use crate::plugins::cache::{Addressing, UpstreamRequest};

use super::hosted;
use super::traits::{NativeMethod, PluginContext, RegistryPlugin, RegistryResponse, UploadRequest};
use super::version;

const CONFIG: &str = "config.json";
const CRATES_API: &str = "api/v1/crates";
const DEFAULT_DOWNLOAD_URL: &str = "https://static.crates.io/crates";

/// Cargo index entry (one line in the index file)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Crate name
    pub name: String,

    /// Crate version
    #[serde(rename = "vers")]
    pub version: String,

    /// Dependencies
    #[serde(default)]
    pub deps: Vec<Dependency>,

    /// SHA256 checksum of the `.crate` file
    #[serde(rename = "cksum", default)]
    pub checksum: String,

    /// Features
    #[serde(default)]
    pub features: BTreeMap<String, Vec<String>>,

    /// Whether the crate is yanked
    #[serde(default)]
    pub yanked: bool,

    /// Links field
    #[serde(default)]
    pub links: Option<String>,
}

/// Dependency in index entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// Name as used in the dependent's code
    pub name: String,

    /// Version requirement
    pub req: String,

    #[serde(default)]
    pub features: Vec<String>,

    #[serde(default)]
    pub optional: bool,

    #[serde(default = "default_true")]
    pub default_features: bool,

    #[serde(default)]
    pub target: Option<String>,

    /// Dependency kind
    #[serde(default)]
    pub kind: Option<String>,

    /// Registry URL, absent for this registry
    #[serde(default)]
    pub registry: Option<String>,

    /// Real crate name when renamed in Cargo.toml
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

fn default_true() -> bool {
    true
}

/// JSON head of a publish request
#[derive(Debug, Clone, Deserialize)]
pub struct PublishMetadata {
    pub name: String,
    pub vers: String,
    #[serde(default)]
    pub deps: Vec<PublishDependency>,
    #[serde(default)]
    pub features: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub links: Option<String>,
}

/// Dependency as cargo sends it on publish
#[derive(Debug, Clone, Deserialize)]
pub struct PublishDependency {
    pub name: String,
    pub version_req: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_true")]
    pub default_features: bool,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub explicit_name_in_toml: Option<String>,
}

impl From<PublishDependency> for Dependency {
    fn from(dep: PublishDependency) -> Self {
        // A renamed dependency is listed under its Cargo.toml name
        let (name, package) = match dep.explicit_name_in_toml {
            Some(alias) => (alias, Some(dep.name)),
            None => (dep.name, None),
        };
        Self {
            name,
            req: dep.version_req,
            features: dep.features,
            optional: dep.optional,
            default_features: dep.default_features,
            target: dep.target,
            kind: dep.kind,
            registry: dep.registry,
            package,
        }
    }
}

/// Index path of a crate name
///
/// - 1 character: 1/{name}
/// - 2 characters: 2/{name}
/// - 3 characters: 3/{first letter}/{name}
/// - 4+ characters: {first two}/{next two}/{name}
pub fn index_path(name: &str) -> String {
    let lower = name.to_lowercase();
    match lower.chars().count() {
        0 => String::new(),
        1 => format!("1/{}", lower),
        2 => format!("2/{}", lower),
        3 => {
            let first: String = lower.chars().take(1).collect();
            format!("3/{}/{}", first, lower)
        }
        _ => {
            let first_two: String = lower.chars().take(2).collect();
            let next_two: String = lower.chars().skip(2).take(2).collect();
            format!("{}/{}/{}", first_two, next_two, lower)
        }
    }
}

/// Crate name of an index path, when the shard prefix matches the name
pub fn parse_index_path(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?.to_lowercase();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    (valid && index_path(&name) == path.to_lowercase()).then_some(name)
}

/// Split cargo's binary publish body into its JSON head and `.crate` bytes
pub fn parse_publish(body: &Bytes) -> Result<(PublishMetadata, Bytes), ParseError> {
    let read_len = |at: usize| -> Result<usize, ParseError> {
        let raw = body
            .get(at..at + 4)
            .ok_or_else(|| ParseError::InvalidBody("truncated publish body".to_string()))?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    };
    let json_len = read_len(0)?;
    let json_end = 4 + json_len;
    let head = body
        .get(4..json_end)
        .ok_or_else(|| ParseError::InvalidBody("truncated publish metadata".to_string()))?;
    let metadata: PublishMetadata = serde_json::from_slice(head)
        .map_err(|e| ParseError::InvalidBody(format!("publish metadata: {}", e)))?;

    let crate_len = read_len(json_end)?;
    let crate_start = json_end + 4;
    if body.len() < crate_start + crate_len {
        return Err(ParseError::InvalidBody("truncated crate file".to_string()));
    }
    Ok((metadata, body.slice(crate_start..crate_start + crate_len)))
}

fn crate_file(name: &str, version: &str) -> String {
    format!("{}-{}.crate", name, version)
}

/// Index file contents: one JSON line per version
pub fn render_index(artifacts: &[Artifact]) -> Result<String, PluginError> {
    let mut sorted: Vec<&Artifact> = artifacts.iter().collect();
    sorted.sort_by(|a, b| version::compare(&a.version, &b.version));
    let mut out = String::new();
    for artifact in sorted {
        let mut entry: IndexEntry = serde_json::from_value(artifact.metadata["index"].clone())
            .map_err(|e| PluginError::Serialization(format!("stored index entry: {}", e)))?;
        entry.checksum = artifact.content_hash.clone();
        entry.yanked = artifact.metadata["yanked"].as_bool().unwrap_or(false);
        out.push_str(
            &serde_json::to_string(&entry).map_err(|e| PluginError::Serialization(e.to_string()))?,
        );
        out.push('\n');
    }
    Ok(out)
}

/// Expand a `dl` template from a registry's config.json
pub fn download_url(template: &str, name: &str, version: &str) -> String {
    let markers = ["{crate}", "{version}", "{prefix}", "{lowerprefix}"];
    if !markers.iter().any(|m| template.contains(m)) {
        return format!("{}/{}/{}/download", template.trim_end_matches('/'), name, version);
    }
    let prefix = index_path(name);
    let prefix = prefix.rsplit_once('/').map(|(p, _)| p).unwrap_or_default();
    template
        .replace("{crate}", name)
        .replace("{version}", version)
        .replace("{prefix}", prefix)
        .replace("{lowerprefix}", &prefix.to_lowercase())
}

/// `(name, version, action)` of `api/v1/crates/{name}/{version}/{action}`
fn parse_crate_api(path: &str) -> Option<(String, String, Option<String>)> {
    let rest = path.trim_matches('/').strip_prefix(CRATES_API)?.strip_prefix('/')?;
    let segments: Vec<&str> = rest.split('/').collect();
    match segments.as_slice() {
        [name, version] if !name.is_empty() && !version.is_empty() => {
            Some((name.to_lowercase(), version.to_string(), None))
        }
        [name, version, action] if !name.is_empty() && !version.is_empty() => Some((
            name.to_lowercase(),
            version.to_string(),
            Some(action.to_string()),
        )),
        _ => None,
    }
}

/// Cargo plugin
#[derive(Debug, Default)]
pub struct CargoPlugin;

impl CargoPlugin {
    pub fn new() -> Self {
        Self
    }

    fn render_config(ctx: &PluginContext) -> Value {
        let mut config = json!({
            "dl": format!("{}/{}", ctx.base_url, CRATES_API),
            "api": ctx.base_url,
        });
        if ctx.repository.config.auth_required {
            config["auth-required"] = json!(true);
        }
        config
    }

    async fn set_yanked(
        &self,
        ctx: &PluginContext,
        name: &str,
        version: &str,
        yanked: bool,
    ) -> Result<(), PluginError> {
        let Some(artifact) = ctx
            .db
            .get_artifact(&ctx.repository.id, name, version, &crate_file(name, version))
            .await?
        else {
            return Err(PluginError::NotFound(format!("{}@{}", name, version)));
        };
        let mut metadata = artifact.metadata.clone();
        metadata["yanked"] = json!(yanked);
        ctx.db.update_artifact_metadata(&artifact.id, &metadata).await?;
        tracing::info!(
            repository = %ctx.repository.name,
            package = %name,
            version = %version,
            yanked,
            "Crate yank state changed"
        );
        Ok(())
    }

    /// Upstream download location, from the upstream config.json unless overridden
    async fn upstream_download(&self, ctx: &PluginContext, name: &str, version: &str) -> Result<String, PluginError> {
        if let Some(template) = ctx.repository.config.extra.get("download_url").and_then(Value::as_str) {
            return Ok(download_url(template, name, version));
        }
        let req = UpstreamRequest::new(CONFIG, ctx.upstream_join(CONFIG)?, Addressing::Mutable);
        let template = match ctx.cache.fetch(&ctx.repository, &req).await? {
            Some(cached) => serde_json::from_slice::<Value>(&cached.body)
                .ok()
                .and_then(|c| c["dl"].as_str().map(String::from)),
            None => None,
        };
        Ok(download_url(
            template.as_deref().unwrap_or(DEFAULT_DOWNLOAD_URL),
            name,
            version,
        ))
    }
}

#[async_trait]
impl RegistryPlugin for CargoPlugin {
    fn manager(&self) -> Manager {
        Manager::Cargo
    }

    fn canonical_name(&self, name: &str) -> String {
        name.to_lowercase()
    }

    fn parse_upload(
        &self,
        path: &str,
        _headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Vec<UploadRequest>, PluginError> {
        if path.trim_matches('/') != format!("{}/new", CRATES_API) {
            return Err(ParseError::InvalidPath(format!("cannot publish to {}", path)).into());
        }
        let (meta, crate_bytes) = parse_publish(&body)?;
        if parse_index_path(&index_path(&meta.name)).is_none() {
            return Err(ParseError::InvalidPackageName(meta.name).into());
        }
        if semver::Version::parse(&meta.vers).is_err() {
            return Err(ParseError::InvalidVersion(meta.vers).into());
        }

        let name = meta.name.to_lowercase();
        let entry = IndexEntry {
            name: meta.name.clone(),
            version: meta.vers.clone(),
            deps: meta.deps.into_iter().map(Dependency::from).collect(),
            checksum: String::new(),
            features: meta.features,
            yanked: false,
            links: meta.links,
        };
        let metadata = json!({
            "index": entry,
            "yanked": false,
            "description": meta.description,
        });
        Ok(vec![UploadRequest::new(
            name.clone(),
            meta.vers.clone(),
            crate_file(&name, &meta.vers),
            crate_bytes,
        )
        .with_content_type("application/x-tar")
        .with_metadata(metadata)])
    }

    fn upload_response(&self, _stored: &[Artifact]) -> RegistryResponse {
        RegistryResponse::json(
            200,
            &json!({ "warnings": { "invalid_categories": [], "invalid_badges": [], "other": [] } }),
        )
    }

    async fn download(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let path = path.trim_matches('/');
        if path == CONFIG {
            return Ok(Some(RegistryResponse::json(200, &Self::render_config(ctx))));
        }
        if let Some((name, version, action)) = parse_crate_api(path) {
            if action.as_deref() != Some("download") {
                return Ok(None);
            }
            return hosted::serve_file(ctx, &name, &version, &crate_file(&name, &version)).await;
        }
        let Some(name) = parse_index_path(path) else {
            return Ok(None);
        };
        let artifacts = ctx.db.list_artifacts(&ctx.repository.id, &name).await?;
        if artifacts.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            RegistryResponse::ok(render_index(&artifacts)?).with_content_type("text/plain"),
        ))
    }

    async fn proxy_fetch(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let path = path.trim_matches('/');
        if path == CONFIG {
            return Ok(Some(RegistryResponse::json(200, &Self::render_config(ctx))));
        }
        if let Some((name, version, Some(action))) = parse_crate_api(path) {
            if action != "download" {
                return Ok(None);
            }
            let url = self.upstream_download(ctx, &name, &version).await?;
            let key = format!("{}/{}/{}/download", CRATES_API, name, version);
            let req = UpstreamRequest::new(key, url, Addressing::Immutable);
            return Ok(ctx
                .cache
                .fetch(&ctx.repository, &req)
                .await?
                .map(|c| RegistryResponse::cached(c).with_content_type("application/x-tar")));
        }
        let Some(req) = self.upstream_request(ctx, path)? else {
            return Ok(None);
        };
        Ok(ctx
            .cache
            .fetch(&ctx.repository, &req)
            .await?
            .map(|c| RegistryResponse::cached(c).with_content_type("text/plain")))
    }

    async fn proxy_versions(&self, ctx: &PluginContext, name: &str) -> Result<Vec<String>, PluginError> {
        let Some(resp) = self.proxy_fetch(ctx, &index_path(name)).await? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&resp.body);
        let versions: Vec<String> = text
            .lines()
            .filter_map(|line| serde_json::from_str::<IndexEntry>(line).ok())
            .map(|e| e.version)
            .collect();
        Ok(version::sorted_distinct(versions.iter().map(String::as_str)))
    }

    fn upstream_request(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<UpstreamRequest>, PluginError> {
        let path = path.trim_matches('/');
        let Some(name) = parse_index_path(path) else {
            return Ok(None);
        };
        let key = index_path(&name);
        let url = ctx.upstream_join(&key)?;
        Ok(Some(UpstreamRequest::new(key, url, Addressing::Mutable)))
    }

    fn parse_delete(&self, path: &str) -> Option<(String, String)> {
        match parse_crate_api(path)? {
            (name, version, None) => Some((name, version)),
            _ => None,
        }
    }

    async fn native_action(
        &self,
        ctx: &PluginContext,
        method: NativeMethod,
        path: &str,
        _body: &Bytes,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let Some((name, version, Some(action))) = parse_crate_api(path) else {
            return Ok(None);
        };
        let yanked = match (method, action.as_str()) {
            (NativeMethod::Delete, "yank") => true,
            (NativeMethod::Put, "unyank") => false,
            _ => return Ok(None),
        };
        self.set_yanked(ctx, &name, &version, yanked).await?;
        Ok(Some(RegistryResponse::json(200, &json!({ "ok": true }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::registry::hosted::testing::{hosted, proxy, BASE_URL};
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn publish_body(meta: Value, crate_bytes: &[u8]) -> Bytes {
        let head = meta.to_string();
        let mut body = Vec::new();
        body.extend_from_slice(&(head.len() as u32).to_le_bytes());
        body.extend_from_slice(head.as_bytes());
        body.extend_from_slice(&(crate_bytes.len() as u32).to_le_bytes());
        body.extend_from_slice(crate_bytes);
        Bytes::from(body)
    }

    fn meta(name: &str, vers: &str) -> Value {
        json!({
            "name": name,
            "vers": vers,
            "deps": [{
                "name": "serde",
                "version_req": "^1",
                "features": ["derive"],
                "optional": false,
                "default_features": true,
                "target": null,
                "kind": "normal",
                "explicit_name_in_toml": "serde_crate"
            }],
            "features": { "default": [] },
            "description": "demo",
            "links": null
        })
    }

    async fn publish(ctx: &PluginContext, name: &str, vers: &str) -> Artifact {
        let plugin = CargoPlugin::new();
        let req = plugin
            .parse_upload("api/v1/crates/new", &[], publish_body(meta(name, vers), b"crate"))
            .unwrap()
            .remove(0);
        plugin.upload(ctx, req).await.unwrap()
    }

    // Test 1: index paths by name length
    #[test]
    fn test_index_path() {
        assert_eq!(index_path("a"), "1/a");
        assert_eq!(index_path("ab"), "2/ab");
        assert_eq!(index_path("abc"), "3/a/abc");
        assert_eq!(index_path("Serde"), "se/rd/serde");
        assert_eq!(parse_index_path("fo/o-/foo-bar").as_deref(), Some("foo-bar"));
        assert_eq!(parse_index_path("xx/o-/foo-bar"), None);
        assert_eq!(parse_index_path("config.json"), None);
    }

    // Test 2: publish body decoding
    #[test]
    fn test_parse_publish() {
        let (meta, data) = parse_publish(&publish_body(meta("demo", "0.1.0"), b"tarball")).unwrap();
        assert_eq!(meta.name, "demo");
        assert_eq!(meta.deps[0].version_req, "^1");
        assert_eq!(data, Bytes::from_static(b"tarball"));

        let mut truncated = publish_body(self::meta("demo", "0.1.0"), b"tarball").to_vec();
        truncated.truncate(truncated.len() - 3);
        assert!(parse_publish(&Bytes::from(truncated)).is_err());
    }

    // Test 3: published crate appears in its sharded index file
    #[tokio::test]
    async fn test_publish_and_index() {
        let ctx = hosted(Manager::Cargo).await;
        let artifact = publish(&ctx, "foo-bar", "0.1.0").await;
        let plugin = CargoPlugin::new();

        let resp = plugin.download(&ctx, "fo/o-/foo-bar").await.unwrap().unwrap();
        let text = String::from_utf8(resp.body.to_vec()).unwrap();
        let line: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(line["name"], "foo-bar");
        assert_eq!(line["vers"], "0.1.0");
        assert_eq!(line["cksum"], artifact.content_hash);
        assert_eq!(line["yanked"], false);
        assert_eq!(line["deps"][0]["name"], "serde_crate");
        assert_eq!(line["deps"][0]["package"], "serde");
        assert_eq!(line["deps"][0]["req"], "^1");

        let download = plugin
            .download(&ctx, "api/v1/crates/foo-bar/0.1.0/download")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(download.body, Bytes::from_static(b"crate"));

        let config = plugin.download(&ctx, "config.json").await.unwrap().unwrap();
        let config: Value = serde_json::from_slice(&config.body).unwrap();
        assert_eq!(config["dl"], format!("{}/api/v1/crates", BASE_URL));
        assert_eq!(config["api"], BASE_URL);
    }

    // Test 4: yank and unyank flip the index flag
    #[tokio::test]
    async fn test_yank_unyank() {
        let ctx = hosted(Manager::Cargo).await;
        publish(&ctx, "demo", "1.0.0").await;
        let plugin = CargoPlugin::new();

        let resp = plugin
            .native_action(&ctx, NativeMethod::Delete, "api/v1/crates/demo/1.0.0/yank", &Bytes::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.status, 200);
        let index = plugin.download(&ctx, "de/mo/demo").await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&index.body).contains("\"yanked\":true"));

        plugin
            .native_action(&ctx, NativeMethod::Put, "api/v1/crates/demo/1.0.0/unyank", &Bytes::new())
            .await
            .unwrap()
            .unwrap();
        let index = plugin.download(&ctx, "de/mo/demo").await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&index.body).contains("\"yanked\":false"));

        let err = plugin
            .native_action(&ctx, NativeMethod::Delete, "api/v1/crates/demo/9.9.9/yank", &Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    // Test 5: republishing a version conflicts
    #[tokio::test]
    async fn test_republish_conflicts() {
        let ctx = hosted(Manager::Cargo).await;
        publish(&ctx, "demo", "1.0.0").await;
        let plugin = CargoPlugin::new();
        let req = plugin
            .parse_upload("api/v1/crates/new", &[], publish_body(meta("demo", "1.0.0"), b"other"))
            .unwrap()
            .remove(0);
        assert!(matches!(
            plugin.upload(&ctx, req).await.unwrap_err(),
            PluginError::AlreadyExists(_)
        ));
    }

    // Test 6: dl templates
    #[test]
    fn test_download_url() {
        assert_eq!(
            download_url("https://static.crates.io/crates", "serde", "1.0.0"),
            "https://static.crates.io/crates/serde/1.0.0/download"
        );
        assert_eq!(
            download_url("https://dl.example/{prefix}/{crate}/{crate}-{version}.crate", "serde", "1.0.0"),
            "https://dl.example/se/rd/serde/serde-1.0.0.crate"
        );
    }

    // Test 7: proxy serves upstream index and downloads through the dl template
    #[tokio::test]
    async fn test_proxy_index_and_download() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/config.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dl": format!("{}/dl", upstream.uri())
            })))
            .mount(&upstream)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/se/rd/serde"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"name\":\"serde\",\"vers\":\"1.0.0\",\"deps\":[],\"cksum\":\"00\",\"features\":{},\"yanked\":false}\n",
            ))
            .mount(&upstream)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/dl/serde/1.0.0/download"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"crate".to_vec()))
            .expect(1)
            .mount(&upstream)
            .await;

        let ctx = proxy(Manager::Cargo, &upstream.uri()).await;
        let plugin = CargoPlugin::new();

        let config = plugin.proxy_fetch(&ctx, "config.json").await.unwrap().unwrap();
        let config: Value = serde_json::from_slice(&config.body).unwrap();
        assert_eq!(config["dl"], format!("{}/api/v1/crates", BASE_URL));

        assert_eq!(plugin.list_versions(&ctx, "serde").await.unwrap(), vec!["1.0.0"]);
        for _ in 0..2 {
            let resp = plugin
                .proxy_fetch(&ctx, "api/v1/crates/serde/1.0.0/download")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(resp.body, Bytes::from_static(b"crate"));
        }
    }
}
