//! Composer plugin
//!
//! - Upload: PUT /packages/upload/{vendor}/{package}/{version} with a zip body
//! - Root: GET /packages.json (metadata-url points at /p2)
//! - Metadata: GET /p2/{vendor}/{package}.json and ~dev.json
//! - Dists: GET /dists/{vendor}/{package}/{version}.zip
//!
//! Proxies rewrite dist URLs to /dists and resolve them back to the upstream
//! URL from the cached metadata on download.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::digest::sha1_hex;
use crate::error::{ParseError, PluginError};
use crate::models::{Artifact, Manager};
use crate::plugins::cache::{Addressing, UpstreamRequest};

use super::archive;
use super::hosted;
use super::traits::{PluginContext, RegistryPlugin, RegistryResponse, UploadRequest};
use super::version;

const UPLOAD: &str = "packages/upload/";
const METADATA: &str = "p2/";
const DISTS: &str = "dists/";

fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
}

/// `vendor/package`, lowercased and validated
pub fn package_name(vendor: &str, package: &str) -> Result<String, ParseError> {
    let (vendor, package) = (vendor.to_lowercase(), package.to_lowercase());
    if !valid_segment(&vendor) || !valid_segment(&package) {
        return Err(ParseError::InvalidPackageName(format!("{}/{}", vendor, package)));
    }
    Ok(format!("{}/{}", vendor, package))
}

/// Development branches go to the `~dev` metadata file
pub fn is_dev(version: &str) -> bool {
    version.starts_with("dev-") || version.ends_with("-dev")
}

fn dist_url(base_url: &str, name: &str, version: &str) -> String {
    format!("{}/{}{}/{}.zip", base_url, DISTS, name, version)
}

/// Root `packages.json`
pub fn render_root(base_url: &str, names: Option<&[String]>) -> Value {
    let mut root = json!({
        "packages": {},
        "metadata-url": format!("{}/{}%package%.json", base_url, METADATA),
    });
    if let Some(names) = names {
        root["available-packages"] = json!(names);
    }
    root
}

/// `p2` metadata for one package
pub fn render_metadata(base_url: &str, name: &str, artifacts: &[Artifact], dev: bool) -> Value {
    let mut versions: Vec<&Artifact> = artifacts.iter().filter(|a| is_dev(&a.version) == dev).collect();
    versions.sort_by(|a, b| version::compare(&b.version, &a.version));
    let entries: Vec<Value> = versions
        .into_iter()
        .map(|a| {
            let mut entry = match &a.metadata["composer"] {
                Value::Object(m) => m.clone(),
                _ => Map::new(),
            };
            entry.insert("name".to_string(), json!(name));
            entry.insert("version".to_string(), json!(a.version));
            entry.insert(
                "dist".to_string(),
                json!({
                    "type": "zip",
                    "url": dist_url(base_url, name, &a.version),
                    "reference": a.metadata["sha1"],
                    "shasum": a.metadata["sha1"],
                }),
            );
            entry.insert("time".to_string(), json!(a.created_at.to_rfc3339()));
            Value::Object(entry)
        })
        .collect();
    let mut packages = Map::new();
    packages.insert(name.to_string(), Value::Array(entries));
    json!({ "packages": packages })
}

/// Upstream dist URL of a version in a (possibly minified) `p2` document
pub fn upstream_dist(doc: &Value, name: &str, version: &str) -> Option<String> {
    doc["packages"][name]
        .as_array()?
        .iter()
        .find(|v| v["version"].as_str() == Some(version))?["dist"]["url"]
        .as_str()
        .map(String::from)
}

/// Point every dist URL of a `p2` document at this repository
pub fn rewrite_dists(doc: &mut Value, base_url: &str, name: &str) {
    let Some(versions) = doc["packages"][name].as_array_mut() else {
        return;
    };
    for entry in versions {
        let Some(version) = entry["version"].as_str().map(String::from) else {
            continue;
        };
        if let Some(dist) = entry.get_mut("dist").and_then(Value::as_object_mut) {
            dist.insert("url".to_string(), json!(dist_url(base_url, name, &version)));
        }
    }
}

/// Split `{vendor}/{package}.json` or `~dev.json` into (name, dev)
fn parse_metadata_path(rest: &str) -> Option<(String, bool)> {
    let (vendor, file) = rest.split_once('/')?;
    let (package, dev) = match file.strip_suffix("~dev.json") {
        Some(p) => (p, true),
        None => (file.strip_suffix(".json")?, false),
    };
    package_name(vendor, package).ok().map(|n| (n, dev))
}

/// Split `{vendor}/{package}/{version}.zip`
fn parse_dist_path(rest: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = rest.split('/').collect();
    let [vendor, package, file] = segments.as_slice() else {
        return None;
    };
    let version = file.strip_suffix(".zip").filter(|v| !v.is_empty())?;
    Some((package_name(vendor, package).ok()?, version.to_string()))
}

/// Composer plugin
#[derive(Debug, Default)]
pub struct ComposerPlugin;

impl ComposerPlugin {
    pub fn new() -> Self {
        Self
    }

    async fn proxy_dist(
        &self,
        ctx: &PluginContext,
        name: &str,
        version: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let file = if is_dev(version) { "~dev.json" } else { ".json" };
        let meta_key = format!("{}{}{}", METADATA, name, file);
        let meta_req = UpstreamRequest::new(&meta_key, ctx.upstream_join(&meta_key)?, Addressing::Mutable);
        let Some(meta) = ctx.cache.fetch(&ctx.repository, &meta_req).await? else {
            return Ok(None);
        };
        let doc: Value = serde_json::from_slice(&meta.body)
            .map_err(|e| PluginError::Serialization(format!("upstream metadata: {}", e)))?;
        let Some(url) = upstream_dist(&doc, name, version) else {
            return Ok(None);
        };

        let key = format!("{}{}/{}.zip", DISTS, name, version);
        let req = UpstreamRequest::new(key, url, Addressing::Immutable);
        Ok(ctx
            .cache
            .fetch(&ctx.repository, &req)
            .await?
            .map(|cached| RegistryResponse::cached(cached).with_content_type("application/zip")))
    }
}

#[async_trait]
impl RegistryPlugin for ComposerPlugin {
    fn manager(&self) -> Manager {
        Manager::Composer
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
        let rest = path
            .trim_matches('/')
            .strip_prefix(UPLOAD)
            .ok_or_else(|| ParseError::InvalidPath(format!("cannot upload to {}", path)))?;
        let segments: Vec<&str> = rest.split('/').collect();
        let [vendor, package, version] = segments.as_slice() else {
            return Err(ParseError::InvalidPath(rest.to_string()).into());
        };
        let name = package_name(vendor, package)?;
        let version = version.trim();
        if version.is_empty() || version.contains("..") {
            return Err(ParseError::InvalidVersion(version.to_string()).into());
        }

        let (_, manifest) = archive::zip_find(&body, |f| f == "composer.json" || f.ends_with("/composer.json"))?
            .ok_or_else(|| ParseError::InvalidBody("archive has no composer.json".to_string()))?;
        let mut manifest: Map<String, Value> = serde_json::from_slice(&manifest)
            .map_err(|e| ParseError::InvalidBody(format!("composer.json: {}", e)))?;
        if let Some(declared) = manifest.get("name").and_then(Value::as_str) {
            if declared.to_lowercase() != name {
                return Err(ParseError::InvalidPackageName(format!(
                    "composer.json names {} but upload is for {}",
                    declared, name
                ))
                .into());
            }
        }
        // Placement decides these
        manifest.remove("version");
        manifest.remove("dist");
        manifest.remove("source");

        let metadata = json!({ "composer": manifest, "sha1": sha1_hex(&body) });
        Ok(vec![UploadRequest::new(
            name,
            version,
            format!("{}.zip", version),
            body,
        )
        .with_content_type("application/zip")
        .with_metadata(metadata)])
    }

    async fn download(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let path = path.trim_start_matches('/');
        if path == "packages.json" {
            let names = ctx.db.list_package_names(&ctx.repository.id).await?;
            return Ok(Some(RegistryResponse::json(
                200,
                &render_root(&ctx.base_url, Some(&names)),
            )));
        }
        if let Some(rest) = path.strip_prefix(METADATA) {
            let Some((name, dev)) = parse_metadata_path(rest) else {
                return Ok(None);
            };
            let artifacts = ctx.db.list_artifacts(&ctx.repository.id, &name).await?;
            if artifacts.is_empty() {
                return Ok(None);
            }
            return Ok(Some(RegistryResponse::json(
                200,
                &render_metadata(&ctx.base_url, &name, &artifacts, dev),
            )));
        }
        if let Some(rest) = path.strip_prefix(DISTS) {
            let Some((name, version)) = parse_dist_path(rest) else {
                return Ok(None);
            };
            return hosted::serve_file(ctx, &name, &version, &format!("{}.zip", version)).await;
        }
        Ok(None)
    }

    async fn proxy_fetch(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let path = path.trim_start_matches('/');
        if path == "packages.json" {
            return Ok(Some(RegistryResponse::json(200, &render_root(&ctx.base_url, None))));
        }
        if let Some(rest) = path.strip_prefix(DISTS) {
            let Some((name, version)) = parse_dist_path(rest) else {
                return Ok(None);
            };
            return self.proxy_dist(ctx, &name, &version).await;
        }
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

    async fn proxy_versions(&self, ctx: &PluginContext, name: &str) -> Result<Vec<String>, PluginError> {
        let name = name.to_lowercase();
        let mut versions = Vec::new();
        for file in [".json", "~dev.json"] {
            let Some(resp) = self
                .proxy_fetch(ctx, &format!("{}{}{}", METADATA, name, file))
                .await?
            else {
                continue;
            };
            let doc: Value = serde_json::from_slice(&resp.body)
                .map_err(|e| PluginError::Serialization(format!("upstream metadata: {}", e)))?;
            if let Some(entries) = doc["packages"][name.as_str()].as_array() {
                versions.extend(entries.iter().filter_map(|e| e["version"].as_str()).map(String::from));
            }
        }
        Ok(version::sorted_distinct(versions.iter().map(String::as_str)))
    }

    fn upstream_request(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<UpstreamRequest>, PluginError> {
        let path = path.trim_start_matches('/');
        let Some(rest) = path.strip_prefix(METADATA) else {
            return Ok(None);
        };
        let Some((name, dev)) = parse_metadata_path(rest) else {
            return Ok(None);
        };
        let key = format!("{}{}{}", METADATA, name, if dev { "~dev.json" } else { ".json" });
        let url = ctx.upstream_join(&key)?;
        Ok(Some(
            UpstreamRequest::new(key, url, Addressing::Mutable).with_accept(["application/json"]),
        ))
    }

    fn rewrite_proxied(
        &self,
        ctx: &PluginContext,
        req: &UpstreamRequest,
        response: RegistryResponse,
    ) -> Result<RegistryResponse, PluginError> {
        let Some((name, _)) = req
            .cache_key
            .strip_prefix(METADATA)
            .and_then(parse_metadata_path)
        else {
            return Ok(response);
        };
        let Ok(mut doc) = serde_json::from_slice::<Value>(&response.body) else {
            return Ok(response);
        };
        rewrite_dists(&mut doc, &ctx.base_url, &name);
        let body = serde_json::to_vec(&doc)
            .map_err(|e| PluginError::Serialization(e.to_string()))?;
        Ok(RegistryResponse {
            body: Bytes::from(body),
            ..response
        })
    }

    fn parse_delete(&self, path: &str) -> Option<(String, String)> {
        let rest = path.trim_matches('/').strip_prefix("packages/")?;
        let segments: Vec<&str> = rest.split('/').collect();
        let [vendor, package, version] = segments.as_slice() else {
            return None;
        };
        Some((package_name(vendor, package).ok()?, version.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::registry::archive::testing::zip;
    use crate::plugins::registry::hosted::testing::{hosted, proxy, BASE_URL};
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dist(name: &str) -> Vec<u8> {
        let manifest = json!({ "name": name, "require": { "php": ">=8.1" } }).to_string();
        zip(&[
            ("acme-demo-abc123/composer.json", manifest.as_bytes()),
            ("acme-demo-abc123/src/Demo.php", b"<?php".as_slice()),
        ])
    }

    async fn upload(ctx: &PluginContext, version: &str) -> Result<Artifact, PluginError> {
        let plugin = ComposerPlugin::new();
        let path = format!("packages/upload/acme/demo/{}", version);
        let req = plugin
            .parse_upload(&path, &[], Bytes::from(dist("acme/demo")))?
            .remove(0);
        plugin.upload(ctx, req).await
    }

    // Test 1: names and dev detection
    #[test]
    fn test_names() {
        assert_eq!(package_name("Acme", "Demo").unwrap(), "acme/demo");
        assert!(package_name("acme", "").is_err());
        assert!(package_name("..", "x").is_err());
        assert!(is_dev("dev-main"));
        assert!(is_dev("2.x-dev"));
        assert!(!is_dev("2.0.0"));
    }

    // Test 2: upload then packages.json, p2 metadata and dist
    #[tokio::test]
    async fn test_upload_and_metadata() {
        let ctx = hosted(Manager::Composer).await;
        upload(&ctx, "1.0.0").await.unwrap();
        upload(&ctx, "1.1.0").await.unwrap();
        upload(&ctx, "dev-main").await.unwrap();
        let plugin = ComposerPlugin::new();

        let root = plugin.download(&ctx, "packages.json").await.unwrap().unwrap();
        let root: Value = serde_json::from_slice(&root.body).unwrap();
        assert_eq!(root["metadata-url"], format!("{}/p2/%package%.json", BASE_URL));
        assert_eq!(root["available-packages"], json!(["acme/demo"]));

        let meta = plugin.download(&ctx, "p2/acme/demo.json").await.unwrap().unwrap();
        let meta: Value = serde_json::from_slice(&meta.body).unwrap();
        let versions = meta["packages"]["acme/demo"].as_array().unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0]["version"], "1.1.0");
        assert_eq!(versions[0]["require"]["php"], ">=8.1");
        assert_eq!(
            versions[0]["dist"]["url"],
            format!("{}/dists/acme/demo/1.1.0.zip", BASE_URL)
        );
        assert_eq!(versions[0]["dist"]["shasum"], sha1_hex(&dist("acme/demo")));

        let dev = plugin.download(&ctx, "p2/acme/demo~dev.json").await.unwrap().unwrap();
        let dev: Value = serde_json::from_slice(&dev.body).unwrap();
        assert_eq!(dev["packages"]["acme/demo"][0]["version"], "dev-main");

        let zip = plugin
            .download(&ctx, "dists/acme/demo/1.0.0.zip")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(zip.body, Bytes::from(dist("acme/demo")));
    }

    // Test 3: mismatched manifest name and missing composer.json are rejected
    #[test]
    fn test_upload_validation() {
        let plugin = ComposerPlugin::new();
        let err = plugin
            .parse_upload("packages/upload/acme/demo/1.0.0", &[], Bytes::from(dist("other/pkg")))
            .unwrap_err();
        assert!(matches!(err, PluginError::Parse(ParseError::InvalidPackageName(_))));

        let bare = zip(&[("README.md", b"x".as_slice())]);
        assert!(plugin
            .parse_upload("packages/upload/acme/demo/1.0.0", &[], Bytes::from(bare))
            .is_err());
    }

    // Test 4: proxied metadata points dists back here and dists resolve upstream
    #[tokio::test]
    async fn test_proxy_dist_resolution() {
        let upstream = MockServer::start().await;
        let meta = json!({
            "packages": {
                "acme/demo": [
                    { "name": "acme/demo", "version": "2.0.0",
                      "dist": { "type": "zip", "url": format!("{}/zipball/abc", upstream.uri()) } }
                ]
            }
        });
        Mock::given(method("GET"))
            .and(url_path("/p2/acme/demo.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&meta))
            .mount(&upstream)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/zipball/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"zipbytes".to_vec()))
            .expect(1)
            .mount(&upstream)
            .await;

        let ctx = proxy(Manager::Composer, &upstream.uri()).await;
        let plugin = ComposerPlugin::new();

        let resp = plugin.proxy_fetch(&ctx, "p2/acme/demo.json").await.unwrap().unwrap();
        let doc: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(
            doc["packages"]["acme/demo"][0]["dist"]["url"],
            format!("{}/dists/acme/demo/2.0.0.zip", BASE_URL)
        );

        for _ in 0..2 {
            let zip = plugin
                .proxy_fetch(&ctx, "dists/acme/demo/2.0.0.zip")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(zip.body, Bytes::from_static(b"zipbytes"));
        }
        assert_eq!(plugin.list_versions(&ctx, "acme/demo").await.unwrap(), vec!["2.0.0"]);
    }
}
