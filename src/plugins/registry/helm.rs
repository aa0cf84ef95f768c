//! Helm chart repository plugin
//!
//! - Index: GET /index.yaml
//! - Charts: GET /charts/{name}-{version}.tgz
//! - Upload: PUT /charts/{file}.tgz, or POST /api/charts (ChartMuseum)
//! - ChartMuseum listing: GET /api/charts and /api/charts/{name}
//! - Delete: DELETE /api/charts/{name}/{version}

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::error::{ParseError, PluginError};
use crate::models::{Artifact, Manager};
use crate::plugins::cache::{Addressing, UpstreamRequest};

use super::archive;
use super::hosted;
use super::multipart;
use super::traits::{header, PluginContext, RegistryPlugin, RegistryResponse, UploadRequest};
use super::version;

const INDEX: &str = "index.yaml";
const CHARTS: &str = "charts/";
const API: &str = "api/charts";
const YAML: &str = "application/x-yaml";

fn chart_file(name: &str, version: &str) -> String {
    format!("{}-{}.tgz", name, version)
}

/// Split `{name}-{version}.tgz`; the version is the first suffix that is semver
pub fn parse_chart_file(file: &str) -> Option<(String, String)> {
    let stem = file.strip_suffix(".tgz")?;
    stem.match_indices('-').find_map(|(i, _)| {
        let (name, version) = (&stem[..i], &stem[i + 1..]);
        (!name.is_empty() && semver::Version::parse(version).is_ok())
            .then(|| (name.to_string(), version.to_string()))
    })
}

/// `Chart.yaml` of a packaged chart
pub fn read_chart(tgz: &[u8]) -> Result<Map<String, Value>, ParseError> {
    let (_, data) = archive::targz_find(tgz, |p| {
        let p = p.trim_start_matches("./");
        p == "Chart.yaml" || (p.ends_with("/Chart.yaml") && p.matches('/').count() == 1)
    })?
    .ok_or_else(|| ParseError::InvalidBody("chart has no Chart.yaml".to_string()))?;
    let chart: Map<String, Value> = serde_yaml::from_slice(&data)
        .map_err(|e| ParseError::InvalidBody(format!("Chart.yaml: {}", e)))?;
    for field in ["name", "version"] {
        if !chart.get(field).map(Value::is_string).unwrap_or(false) {
            return Err(ParseError::MissingParameter(format!("Chart.yaml {}", field)));
        }
    }
    Ok(chart)
}

fn to_yaml(value: &Value) -> Result<String, PluginError> {
    serde_yaml::to_string(value).map_err(|e| PluginError::Serialization(e.to_string()))
}

/// `index.yaml` document for every stored chart
pub fn render_index(base_url: &str, artifacts: &[Artifact]) -> Value {
    let mut entries = Map::new();
    let mut sorted: Vec<&Artifact> = artifacts.iter().collect();
    sorted.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then_with(|| version::compare(&b.version, &a.version))
    });
    for a in sorted {
        let mut entry = match &a.metadata["chart"] {
            Value::Object(m) => m.clone(),
            _ => Map::new(),
        };
        entry.insert("name".to_string(), json!(a.name));
        entry.insert("version".to_string(), json!(a.version));
        entry.insert("digest".to_string(), json!(a.content_hash));
        entry.insert("created".to_string(), json!(a.created_at.to_rfc3339()));
        entry.insert(
            "urls".to_string(),
            json!([format!("{}/{}{}", base_url, CHARTS, a.path)]),
        );
        if let Value::Array(list) = entries
            .entry(a.name.clone())
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            list.push(Value::Object(entry));
        }
    }
    json!({
        "apiVersion": "v1",
        "entries": entries,
        "generated": Utc::now().to_rfc3339(),
    })
}

/// Resolve a chart URL from an upstream index against the upstream base
fn resolve(upstream: &str, url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("{}/{}", upstream.trim_end_matches('/'), url.trim_start_matches('/'))
    }
}

/// Upstream URL of one chart version in an upstream index
pub fn upstream_chart_url(index: &Value, upstream: &str, name: &str, version: &str) -> Option<String> {
    index["entries"][name]
        .as_array()?
        .iter()
        .find(|e| e["version"].as_str() == Some(version))?["urls"]
        .as_array()?
        .iter()
        .find_map(Value::as_str)
        .map(|u| resolve(upstream, u))
}

/// Point every chart URL of an upstream index at this repository
pub fn rewrite_index(index: &mut Value, base_url: &str) {
    let Some(entries) = index["entries"].as_object_mut() else {
        return;
    };
    for (name, versions) in entries.iter_mut() {
        let Some(versions) = versions.as_array_mut() else {
            continue;
        };
        for entry in versions {
            let Some(version) = entry["version"].as_str().map(String::from) else {
                continue;
            };
            entry["urls"] = json!([format!("{}/{}{}", base_url, CHARTS, chart_file(name, &version))]);
        }
    }
}

/// Helm plugin
#[derive(Debug, Default)]
pub struct HelmPlugin;

impl HelmPlugin {
    pub fn new() -> Self {
        Self
    }

    fn chart_upload(tgz: Bytes) -> Result<UploadRequest, PluginError> {
        let chart = read_chart(&tgz)?;
        let name = chart["name"].as_str().unwrap_or_default().to_string();
        let version = chart["version"].as_str().unwrap_or_default().to_string();
        if name.contains('/') || name.contains("..") || version.contains('/') {
            return Err(ParseError::InvalidPackageName(format!("{}-{}", name, version)).into());
        }
        Ok(UploadRequest::new(
            name.clone(),
            version.clone(),
            chart_file(&name, &version),
            tgz,
        )
        .with_content_type("application/gzip")
        .with_metadata(json!({ "chart": chart })))
    }

    async fn upstream_index(&self, ctx: &PluginContext) -> Result<Option<Value>, PluginError> {
        let req = UpstreamRequest::new(INDEX, ctx.upstream_join(INDEX)?, Addressing::Mutable);
        let Some(cached) = ctx.cache.fetch(&ctx.repository, &req).await? else {
            return Ok(None);
        };
        serde_yaml::from_slice(&cached.body)
            .map(Some)
            .map_err(|e| PluginError::Serialization(format!("upstream index.yaml: {}", e)))
    }
}

#[async_trait]
impl RegistryPlugin for HelmPlugin {
    fn manager(&self) -> Manager {
        Manager::Helm
    }

    fn parse_upload(
        &self,
        path: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Vec<UploadRequest>, PluginError> {
        let path = path.trim_matches('/');
        if path == API {
            let tgz = match header(headers, "content-type").and_then(multipart::boundary) {
                Some(boundary) => multipart::parse(&body, &boundary)?
                    .into_iter()
                    .find(|p| p.name == "chart")
                    .map(|p| p.data)
                    .ok_or_else(|| ParseError::MissingParameter("chart".to_string()))?,
                None => body,
            };
            return Ok(vec![Self::chart_upload(tgz)?]);
        }
        if let Some(file) = path.strip_prefix(CHARTS) {
            let req = Self::chart_upload(body)?;
            if file != req.path {
                return Err(ParseError::InvalidPath(format!(
                    "{} does not match chart {}",
                    file, req.path
                ))
                .into());
            }
            return Ok(vec![req]);
        }
        Err(ParseError::InvalidPath(format!("cannot upload to {}", path)).into())
    }

    fn upload_response(&self, _stored: &[Artifact]) -> RegistryResponse {
        RegistryResponse::json(201, &json!({ "saved": true }))
    }

    async fn download(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let path = path.trim_matches('/');
        if path == INDEX {
            let artifacts = ctx.db.list_repository_artifacts(&ctx.repository.id).await?;
            let yaml = to_yaml(&render_index(&ctx.base_url, &artifacts))?;
            return Ok(Some(RegistryResponse::ok(yaml).with_content_type(YAML)));
        }
        if let Some(file) = path.strip_prefix(CHARTS) {
            let Some((name, version)) = parse_chart_file(file) else {
                return Ok(None);
            };
            return hosted::serve_file(ctx, &name, &version, file).await;
        }
        if path == API {
            let mut listing = Map::new();
            for name in ctx.db.list_package_names(&ctx.repository.id).await? {
                let versions = self.list_versions(ctx, &name).await?;
                listing.insert(name, json!(versions));
            }
            return Ok(Some(RegistryResponse::json(200, &Value::Object(listing))));
        }
        if let Some(name) = path.strip_prefix("api/charts/") {
            if name.contains('/') {
                return Ok(None);
            }
            let artifacts = ctx.db.list_artifacts(&ctx.repository.id, name).await?;
            if artifacts.is_empty() {
                return Ok(None);
            }
            let versions: Vec<Value> = version::sorted_distinct(artifacts.iter().map(|a| a.version.as_str()))
                .into_iter()
                .rev()
                .map(|v| json!({ "name": name, "version": v }))
                .collect();
            return Ok(Some(RegistryResponse::json(200, &Value::Array(versions))));
        }
        Ok(None)
    }

    async fn proxy_fetch(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let path = path.trim_matches('/');
        if path == INDEX {
            let Some(mut index) = self.upstream_index(ctx).await? else {
                return Ok(None);
            };
            rewrite_index(&mut index, &ctx.base_url);
            return Ok(Some(RegistryResponse::ok(to_yaml(&index)?).with_content_type(YAML)));
        }
        if let Some((name, version)) = path.strip_prefix(CHARTS).and_then(parse_chart_file) {
            let Some(index) = self.upstream_index(ctx).await? else {
                return Ok(None);
            };
            let Some(url) = upstream_chart_url(&index, ctx.upstream_url()?, &name, &version) else {
                return Ok(None);
            };
            let req = UpstreamRequest::new(path, url, Addressing::Immutable);
            return Ok(ctx
                .cache
                .fetch(&ctx.repository, &req)
                .await?
                .map(|c| RegistryResponse::cached(c).with_content_type("application/gzip")));
        }
        Ok(None)
    }

    async fn proxy_versions(&self, ctx: &PluginContext, name: &str) -> Result<Vec<String>, PluginError> {
        let Some(index) = self.upstream_index(ctx).await? else {
            return Ok(Vec::new());
        };
        let versions: Vec<&str> = index["entries"][name]
            .as_array()
            .map(|e| e.iter().filter_map(|v| v["version"].as_str()).collect())
            .unwrap_or_default();
        Ok(version::sorted_distinct(versions))
    }

    fn upstream_request(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<UpstreamRequest>, PluginError> {
        let path = path.trim_matches('/');
        if path == INDEX {
            return Ok(Some(UpstreamRequest::new(
                INDEX,
                ctx.upstream_join(INDEX)?,
                Addressing::Mutable,
            )));
        }
        // Chart URLs are only known once the upstream index is read
        Ok(None)
    }

    fn parse_delete(&self, path: &str) -> Option<(String, String)> {
        let rest = path.trim_matches('/').strip_prefix("api/charts/")?;
        let (name, version) = rest.split_once('/')?;
        (!name.is_empty() && !version.is_empty() && !version.contains('/'))
            .then(|| (name.to_string(), version.to_string()))
    }
}
