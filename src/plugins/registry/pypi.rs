//! PyPI plugin
//!
//! Hosted repositories accept twine uploads (multipart POST to the repository
//! root) and serve the PEP 503 Simple API plus the JSON API. Proxies rewrite
//! links to the upstream file host so downloads come back through the cache.

use async_trait::async_trait;
use quick_xml::escape::escape;
use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::digest::ContentDigest;
use crate::error::{ParseError, PluginError};
use crate::models::{Artifact, Manager};
use crate::plugins::cache::{Addressing, UpstreamRequest};

use super::hosted;
use super::multipart::{self, Part};
use super::traits::{header, PluginContext, RegistryPlugin, RegistryResponse, UploadRequest};
use super::version;

const SIMPLE: &str = "simple/";
const PACKAGES: &str = "packages/";
const FILES: &str = "files/";
const DEFAULT_FILES_URL: &str = "https://files.pythonhosted.org";

/// Normalize a project name (PEP 503): runs of `-_.` become one `-`, lowercased
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                out.push('-');
            }
            in_separator = true;
        } else {
            out.extend(c.to_lowercase());
            in_separator = false;
        }
    }
    out
}

fn file_url(base_url: &str, artifact: &Artifact) -> String {
    format!(
        "{}/{}{}/{}/{}",
        base_url, PACKAGES, artifact.name, artifact.version, artifact.path
    )
}

/// Simple API root listing every project
pub fn render_root(base_url: &str, names: &[String]) -> String {
    let mut html = String::from("<!DOCTYPE html>\n<html><head><title>Simple index</title></head><body>\n");
    for name in names {
        html.push_str(&format!(
            "<a href=\"{}/{}{}/\">{}</a><br/>\n",
            base_url,
            SIMPLE,
            name,
            escape(name)
        ));
    }
    html.push_str("</body></html>\n");
    html
}

/// Simple API project page; each link carries the file's sha256 fragment
pub fn render_project(base_url: &str, name: &str, artifacts: &[Artifact]) -> String {
    let mut html = format!(
        "<!DOCTYPE html>\n<html><head><title>Links for {0}</title></head><body>\n<h1>Links for {0}</h1>\n",
        escape(name)
    );
    let mut sorted: Vec<&Artifact> = artifacts.iter().collect();
    sorted.sort_by(|a, b| version::compare(&a.version, &b.version).then(a.path.cmp(&b.path)));
    for artifact in sorted {
        let requires = artifact.metadata["requires_python"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|r| format!(" data-requires-python=\"{}\"", escape(r)))
            .unwrap_or_default();
        html.push_str(&format!(
            "<a href=\"{}#sha256={}\"{}>{}</a><br/>\n",
            file_url(base_url, artifact),
            artifact.content_hash,
            requires,
            escape(&artifact.path)
        ));
    }
    html.push_str("</body></html>\n");
    html
}

/// JSON API document (`/pypi/{name}/json`)
pub fn render_json(base_url: &str, artifacts: &[Artifact]) -> Value {
    let versions = version::sorted_distinct(artifacts.iter().map(|a| a.version.as_str()));
    let latest = version::latest(versions.iter().map(String::as_str));
    let mut releases = Map::new();
    for v in &versions {
        let files: Vec<Value> = artifacts
            .iter()
            .filter(|a| &a.version == v)
            .map(|a| {
                json!({
                    "filename": a.path,
                    "url": file_url(base_url, a),
                    "size": a.size,
                    "digests": { "sha256": a.content_hash },
                    "requires_python": a.metadata["requires_python"],
                    "upload_time_iso_8601": a.created_at.to_rfc3339(),
                })
            })
            .collect();
        releases.insert(v.clone(), Value::Array(files));
    }
    let display = artifacts
        .iter()
        .find(|a| Some(a.version.as_str()) == latest.as_deref())
        .or_else(|| artifacts.first());
    json!({
        "info": {
            "name": display.and_then(|a| a.metadata["name"].as_str()).unwrap_or_default(),
            "version": latest,
            "summary": display.map(|a| a.metadata["summary"].clone()).unwrap_or(Value::Null),
        },
        "releases": releases,
    })
}

/// PyPI plugin
#[derive(Debug, Default)]
pub struct PypiPlugin;

impl PypiPlugin {
    pub fn new() -> Self {
        Self
    }

    fn files_url(ctx: &PluginContext) -> String {
        ctx.repository
            .config
            .extra
            .get("files_url")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_FILES_URL)
            .trim_end_matches('/')
            .to_string()
    }

    fn field<'a>(parts: &'a [Part], name: &str) -> Option<&'a Part> {
        parts.iter().find(|p| p.name == name)
    }
}

#[async_trait]
impl RegistryPlugin for PypiPlugin {
    fn manager(&self) -> Manager {
        Manager::Pypi
    }

    fn canonical_name(&self, name: &str) -> String {
        normalize_name(name)
    }

    fn parse_upload(
        &self,
        path: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Vec<UploadRequest>, PluginError> {
        let path = path.trim_matches('/');
        if !(path.is_empty() || path == "legacy") {
            return Err(ParseError::InvalidPath(format!("cannot upload to {}", path)).into());
        }
        let boundary = header(headers, "content-type")
            .and_then(multipart::boundary)
            .ok_or_else(|| ParseError::InvalidBody("expected multipart/form-data".to_string()))?;
        let parts = multipart::parse(&body, &boundary)?;

        if let Some(action) = Self::field(&parts, ":action") {
            if action.text() != "file_upload" {
                return Err(PluginError::Unsupported(format!("action {}", action.text())));
            }
        }
        let text = |name: &str| Self::field(&parts, name).map(Part::text);
        let display_name =
            text("name").ok_or_else(|| ParseError::MissingParameter("name".to_string()))?;
        let version =
            text("version").ok_or_else(|| ParseError::MissingParameter("version".to_string()))?;
        let content = Self::field(&parts, "content")
            .ok_or_else(|| ParseError::MissingParameter("content".to_string()))?;
        let filename = content
            .filename
            .as_deref()
            .map(hosted::file_name)
            .ok_or_else(|| ParseError::MissingParameter("content filename".to_string()))?
            .to_string();

        let metadata = json!({
            "name": display_name,
            "summary": text("summary"),
            "requires_python": text("requires_python"),
            "filetype": text("filetype"),
        });
        let mut req = UploadRequest::new(
            normalize_name(&display_name),
            version.trim(),
            filename,
            content.data.clone(),
        )
        .with_content_type("application/octet-stream")
        .with_metadata(metadata);
        if let Some(claimed) = text("sha256_digest").filter(|d| !d.is_empty()) {
            let expected = format!("sha256:{}", claimed.trim().to_lowercase())
                .parse::<ContentDigest>()
                .map_err(|_| ParseError::InvalidBody("malformed sha256_digest".to_string()))?;
            req = req.with_expected_digest(expected);
        }
        Ok(vec![req])
    }

    async fn download(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let path = path.trim_start_matches('/');

        if path == SIMPLE || path == "simple" {
            let names = ctx.db.list_package_names(&ctx.repository.id).await?;
            return Ok(Some(
                RegistryResponse::ok(render_root(&ctx.base_url, &names))
                    .with_content_type("text/html; charset=utf-8"),
            ));
        }
        if let Some(rest) = path.strip_prefix(SIMPLE) {
            let name = normalize_name(rest.trim_end_matches('/'));
            let artifacts = ctx.db.list_artifacts(&ctx.repository.id, &name).await?;
            if artifacts.is_empty() {
                return Ok(None);
            }
            return Ok(Some(
                RegistryResponse::ok(render_project(&ctx.base_url, &name, &artifacts))
                    .with_content_type("text/html; charset=utf-8"),
            ));
        }
        if let Some(rest) = path.strip_prefix("pypi/") {
            let Some(name) = rest.trim_end_matches('/').strip_suffix("/json") else {
                return Ok(None);
            };
            let artifacts = ctx
                .db
                .list_artifacts(&ctx.repository.id, &normalize_name(name))
                .await?;
            if artifacts.is_empty() {
                return Ok(None);
            }
            return Ok(Some(RegistryResponse::json(
                200,
                &render_json(&ctx.base_url, &artifacts),
            )));
        }
        if let Some(rest) = path.strip_prefix(PACKAGES) {
            let segments: Vec<&str> = rest.split('/').collect();
            if let [name, ver, file] = segments.as_slice() {
                return hosted::serve_file(ctx, &normalize_name(name), ver, file).await;
            }
        }
        Ok(None)
    }

    async fn proxy_versions(&self, ctx: &PluginContext, name: &str) -> Result<Vec<String>, PluginError> {
        let path = format!("pypi/{}/json", normalize_name(name));
        let Some(doc) = self.proxy_fetch(ctx, &path).await? else {
            return Ok(Vec::new());
        };
        let doc: Value = serde_json::from_slice(&doc.body)
            .map_err(|e| PluginError::Serialization(format!("upstream project json: {}", e)))?;
        let versions: Vec<&str> = doc["releases"]
            .as_object()
            .map(|r| r.keys().map(String::as_str).collect())
            .unwrap_or_default();
        Ok(version::sorted_distinct(versions))
    }

    fn upstream_request(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<UpstreamRequest>, PluginError> {
        let path = path.trim_start_matches('/');
        if let Some(rest) = path.strip_prefix(FILES) {
            if rest.is_empty() || rest.split('/').any(|s| s == "..") {
                return Ok(None);
            }
            let url = format!("{}/{}", Self::files_url(ctx), rest);
            return Ok(Some(UpstreamRequest::new(path, url, Addressing::Immutable)));
        }
        if let Some(rest) = path.strip_prefix(SIMPLE) {
            let key = match rest.trim_end_matches('/') {
                "" => SIMPLE.to_string(),
                name => format!("{}{}/", SIMPLE, normalize_name(name)),
            };
            let url = ctx.upstream_join(&key)?;
            return Ok(Some(
                UpstreamRequest::new(key, url, Addressing::Mutable).with_accept(["text/html"]),
            ));
        }
        if path.starts_with("pypi/") && path.ends_with("/json") {
            let url = ctx.upstream_join(path)?;
            return Ok(Some(
                UpstreamRequest::new(path, url, Addressing::Mutable).with_accept(["application/json"]),
            ));
        }
        Ok(None)
    }

    fn rewrite_proxied(
        &self,
        ctx: &PluginContext,
        req: &UpstreamRequest,
        response: RegistryResponse,
    ) -> Result<RegistryResponse, PluginError> {
        if req.addressing == Addressing::Immutable {
            return Ok(response);
        }
        let files = format!("{}/{}", ctx.base_url, FILES.trim_end_matches('/'));
        let response = hosted::rewrite_urls(response, &Self::files_url(ctx), &files);
        Ok(hosted::rewrite_urls(response, ctx.upstream_url()?, &ctx.base_url))
    }

    fn parse_delete(&self, path: &str) -> Option<(String, String)> {
        let rest = path.trim_matches('/').strip_prefix(PACKAGES)?;
        let mut segments = rest.split('/');
        let name = segments.next().filter(|s| !s.is_empty())?;
        let ver = segments.next().filter(|s| !s.is_empty())?;
        Some((normalize_name(name), ver.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Repository, RepositoryConfig, RepositoryType};
    use crate::plugins::registry::hosted::testing::{context_with, hosted, BASE_URL};
    use crate::plugins::registry::multipart::testing::encode;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn twine(name: &str, version: &str, filename: &str, content: &[u8], digest: &str) -> (Vec<(String, String)>, Bytes) {
        let (ct, body) = encode(&[
            (":action", None, b"file_upload".as_slice()),
            ("name", None, name.as_bytes()),
            ("version", None, version.as_bytes()),
            ("requires_python", None, b">=3.8".as_slice()),
            ("sha256_digest", None, digest.as_bytes()),
            ("content", Some(filename), content),
        ]);
        (vec![("Content-Type".to_string(), ct)], Bytes::from(body))
    }

    async fn upload(ctx: &PluginContext, name: &str, version: &str, filename: &str, content: &[u8]) -> Result<Artifact, PluginError> {
        let plugin = PypiPlugin::new();
        let digest = ContentDigest::compute(content).to_hex();
        let (headers, body) = twine(name, version, filename, content, &digest);
        let req = plugin.parse_upload("", &headers, body)?.remove(0);
        plugin.upload(ctx, req).await
    }

    // Test 1: PEP 503 normalization
    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Requests"), "requests");
        assert_eq!(normalize_name("Flask_RESTful"), "flask-restful");
        assert_eq!(normalize_name("zope.interface"), "zope-interface");
        assert_eq!(normalize_name("a-_.b"), "a-b");
    }

    // Test 2: upload then simple index and project page
    #[tokio::test]
    async fn test_upload_and_simple_pages() {
        let ctx = hosted(Manager::Pypi).await;
        let artifact = upload(&ctx, "My_Pkg", "1.0", "my_pkg-1.0-py3-none-any.whl", b"wheel")
            .await
            .unwrap();
        assert_eq!(artifact.name, "my-pkg");

        let plugin = PypiPlugin::new();
        let root = plugin.download(&ctx, "simple/").await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&root.body).contains("/simple/my-pkg/"));

        let page = plugin.download(&ctx, "simple/My.Pkg/").await.unwrap().unwrap();
        let html = String::from_utf8_lossy(&page.body).into_owned();
        assert!(html.contains(&format!(
            "{}/packages/my-pkg/1.0/my_pkg-1.0-py3-none-any.whl#sha256={}",
            BASE_URL,
            ContentDigest::compute(b"wheel").to_hex()
        )));
        assert!(html.contains("data-requires-python=\"&gt;=3.8\""));

        let file = plugin
            .download(&ctx, "packages/my-pkg/1.0/my_pkg-1.0-py3-none-any.whl")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.body, Bytes::from_static(b"wheel"));
    }

    // Test 3: wrong digest and duplicate filenames are rejected
    #[tokio::test]
    async fn test_upload_rejections() {
        let ctx = hosted(Manager::Pypi).await;
        let plugin = PypiPlugin::new();
        let (headers, body) = twine("demo", "1.0", "demo-1.0.tar.gz", b"sdist", &"0".repeat(64));
        let req = plugin.parse_upload("", &headers, body).unwrap().remove(0);
        assert!(matches!(
            plugin.upload(&ctx, req).await.unwrap_err(),
            PluginError::DigestMismatch { .. }
        ));

        upload(&ctx, "demo", "1.0", "demo-1.0.tar.gz", b"sdist").await.unwrap();
        // Another file of the same release is fine; the same file again is not
        upload(&ctx, "demo", "1.0", "demo-1.0-py3-none-any.whl", b"wheel").await.unwrap();
        let err = upload(&ctx, "demo", "1.0", "demo-1.0.tar.gz", b"sdist2").await.unwrap_err();
        assert!(matches!(err, PluginError::AlreadyExists(_)));
    }

    // Test 4: JSON API and version listing
    #[tokio::test]
    async fn test_json_api() {
        let ctx = hosted(Manager::Pypi).await;
        upload(&ctx, "demo", "1.0", "demo-1.0.tar.gz", b"a").await.unwrap();
        upload(&ctx, "demo", "1.10", "demo-1.10.tar.gz", b"b").await.unwrap();
        upload(&ctx, "demo", "1.9", "demo-1.9.tar.gz", b"c").await.unwrap();

        let plugin = PypiPlugin::new();
        let resp = plugin.download(&ctx, "pypi/Demo/json").await.unwrap().unwrap();
        let doc: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(doc["info"]["version"], "1.10");
        assert_eq!(doc["releases"].as_object().unwrap().len(), 3);

        assert_eq!(
            plugin.list_versions(&ctx, "demo").await.unwrap(),
            vec!["1.0", "1.9", "1.10"]
        );
    }

    // Test 5: proxied pages point file links back through the repository
    #[tokio::test]
    async fn test_proxy_rewrites_file_links() {
        let upstream = MockServer::start().await;
        let files = MockServer::start().await;
        let page = format!(
            "<a href=\"{}/packages/ab/cd/demo-1.0.tar.gz#sha256=00\">demo-1.0.tar.gz</a>",
            files.uri()
        );
        Mock::given(method("GET"))
            .and(url_path("/simple/demo/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&upstream)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/packages/ab/cd/demo-1.0.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"sdist".to_vec()))
            .expect(1)
            .mount(&files)
            .await;

        let mut extra = Map::new();
        extra.insert("files_url".to_string(), Value::String(files.uri()));
        let ctx = context_with(Repository::new(
            "r",
            RepositoryType::Proxy,
            Manager::Pypi,
            RepositoryConfig {
                upstream_url: Some(upstream.uri()),
                extra,
                ..Default::default()
            },
        ))
        .await;
        let plugin = PypiPlugin::new();

        let resp = plugin.proxy_fetch(&ctx, "simple/Demo/").await.unwrap().unwrap();
        let html = String::from_utf8_lossy(&resp.body).into_owned();
        assert!(html.contains(&format!("{}/files/packages/ab/cd/demo-1.0.tar.gz", BASE_URL)));

        for _ in 0..2 {
            let file = plugin
                .proxy_fetch(&ctx, "files/packages/ab/cd/demo-1.0.tar.gz")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(file.body, Bytes::from_static(b"sdist"));
        }
    }

    // Test 6: delete paths
    #[test]
    fn test_parse_delete() {
        let plugin = PypiPlugin::new();
        assert_eq!(
            plugin.parse_delete("packages/My_Pkg/1.0"),
            Some(("my-pkg".to_string(), "1.0".to_string()))
        );
        assert_eq!(
            plugin.parse_delete("packages/demo/1.0/demo-1.0.tar.gz"),
            Some(("demo".to_string(), "1.0".to_string()))
        );
        assert_eq!(plugin.parse_delete("simple/demo/"), None);
    }
}
