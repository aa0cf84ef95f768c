//! NuGet v3 plugin
//!
//! Endpoints:
//! - Service index: GET /v3/index.json
//! - Flat container: GET /v3-flatcontainer/{id}/index.json,
//!   /v3-flatcontainer/{id}/{ver}/{id}.{ver}.nupkg and /{id}.nuspec
//! - Registration: GET /v3/registration/{id}/index.json
//! - Push: PUT /api/v2/package (multipart, one `.nupkg`)
//! - Delete: DELETE /api/v2/package/{id}/{ver}
//!
//! Ids and versions are lowercased everywhere, as the flat container requires.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{json, Value};

use crate::error::{ParseError, PluginError};
use crate::models::{Artifact, Manager};
use crate::plugins::cache::{Addressing, UpstreamRequest};

use super::archive;
use super::hosted;
use super::multipart;
use super::traits::{header, PluginContext, RegistryPlugin, RegistryResponse, UploadRequest};
use super::version;

const FLAT: &str = "v3-flatcontainer/";
const REGISTRATION: &str = "v3/registration/";
const UPSTREAM_REGISTRATION: &str = "v3/registration5-semver1/";
const PUBLISH: &str = "api/v2/package";

/// Normalized NuGet version: lowercase, no build metadata, at least three parts
pub fn normalize_version(raw: &str) -> String {
    let raw = raw.trim().to_lowercase();
    let raw = raw.split('+').next().unwrap_or(&raw).to_string();
    let (core, pre) = match raw.split_once('-') {
        Some((c, p)) => (c.to_string(), Some(p.to_string())),
        None => (raw.clone(), None),
    };
    let mut parts: Vec<String> = core
        .split('.')
        .map(|p| p.parse::<u64>().map(|n| n.to_string()).unwrap_or_else(|_| p.to_string()))
        .collect();
    while parts.len() < 3 {
        parts.push("0".to_string());
    }
    if parts.len() == 4 && parts[3] == "0" {
        parts.pop();
    }
    match pre {
        Some(pre) => format!("{}-{}", parts.join("."), pre),
        None => parts.join("."),
    }
}

/// Text children of `<package><metadata>`, first occurrence of each
pub fn metadata_fields(xml: &str) -> Result<HashMap<String, String>, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut fields = HashMap::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(e)) => {
                if let [package, metadata, field] = path.as_slice() {
                    if package == "package" && metadata == "metadata" && !fields.contains_key(field) {
                        let text = e
                            .unescape()
                            .map_err(|e| ParseError::InvalidBody(format!("bad nuspec text: {}", e)))?;
                        fields.insert(field.clone(), text.trim().to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ParseError::InvalidBody(format!("malformed nuspec: {}", e))),
        }
    }
    Ok(fields)
}

/// Facts read from a package's `.nuspec`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nuspec {
    pub id: String,
    pub version: String,
    pub description: Option<String>,
    pub authors: Option<String>,
    pub xml: String,
}

/// Read the `.nuspec` at the root of a `.nupkg`
pub fn read_nuspec(nupkg: &[u8]) -> Result<Nuspec, ParseError> {
    let (_, data) = archive::zip_find(nupkg, |name| {
        !name.contains('/') && name.to_lowercase().ends_with(".nuspec")
    })?
    .ok_or_else(|| ParseError::InvalidBody("package has no .nuspec".to_string()))?;
    let xml = String::from_utf8_lossy(&data).into_owned();
    let mut fields = metadata_fields(&xml)?;
    Ok(Nuspec {
        id: fields
            .remove("id")
            .ok_or_else(|| ParseError::MissingParameter("nuspec id".to_string()))?,
        version: fields
            .remove("version")
            .ok_or_else(|| ParseError::MissingParameter("nuspec version".to_string()))?,
        description: fields.remove("description"),
        authors: fields.remove("authors"),
        xml,
    })
}

fn nupkg_name(id: &str, version: &str) -> String {
    format!("{}.{}.nupkg", id, version)
}

/// The v3 service index
pub fn render_service_index(base_url: &str) -> Value {
    let resource = |id: String, kind: &str| json!({ "@id": id, "@type": kind });
    json!({
        "version": "3.0.0",
        "resources": [
            resource(format!("{}/{}", base_url, FLAT), "PackageBaseAddress/3.0.0"),
            resource(format!("{}/{}", base_url, PUBLISH), "PackagePublish/2.0.0"),
            resource(format!("{}/{}", base_url, REGISTRATION), "RegistrationsBaseUrl/3.6.0"),
            resource(format!("{}/{}", base_url, REGISTRATION), "RegistrationsBaseUrl"),
        ]
    })
}

/// Registration index with every version inlined in one page
pub fn render_registration(base_url: &str, id: &str, artifacts: &[Artifact]) -> Value {
    let versions = version::sorted_distinct(artifacts.iter().map(|a| a.version.as_str()));
    let index_url = format!("{}/{}{}/index.json", base_url, REGISTRATION, id);
    let items: Vec<Value> = versions
        .iter()
        .filter_map(|v| artifacts.iter().find(|a| &a.version == v))
        .map(|a| {
            let leaf = format!("{}/{}{}/{}.json", base_url, REGISTRATION, id, a.version);
            json!({
                "@id": leaf,
                "catalogEntry": {
                    "@id": leaf,
                    "id": a.metadata["id"].as_str().unwrap_or(id),
                    "version": a.version,
                    "description": a.metadata["description"],
                    "authors": a.metadata["authors"],
                    "listed": true,
                    "packageContent": format!("{}/{}{}/{}/{}", base_url, FLAT, id, a.version, a.path),
                },
                "packageContent": format!("{}/{}{}/{}/{}", base_url, FLAT, id, a.version, a.path),
            })
        })
        .collect();

    json!({
        "@id": index_url,
        "count": 1,
        "items": [{
            "@id": format!("{}#page", index_url),
            "count": items.len(),
            "lower": versions.first(),
            "upper": versions.last(),
            "items": items,
        }]
    })
}

/// NuGet plugin
#[derive(Debug, Default)]
pub struct NugetPlugin;

impl NugetPlugin {
    pub fn new() -> Self {
        Self
    }

    /// The nupkg bytes of a push, multipart or raw
    fn pushed_package(headers: &[(String, String)], body: Bytes) -> Result<Bytes, ParseError> {
        let Some(boundary) = header(headers, "content-type").and_then(multipart::boundary) else {
            return Ok(body);
        };
        multipart::parse(&body, &boundary)?
            .into_iter()
            .find(|p| p.filename.is_some() || p.name == "package")
            .map(|p| p.data)
            .ok_or_else(|| ParseError::InvalidBody("push carries no package".to_string()))
    }
}

#[async_trait]
impl RegistryPlugin for NugetPlugin {
    fn manager(&self) -> Manager {
        Manager::Nuget
    }

    fn canonical_name(&self, name: &str) -> String {
        name.to_lowercase()
    }

    fn parse_upload(
        &self,
        path: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Vec<UploadRequest>, PluginError> {
        if path.trim_end_matches('/') != PUBLISH {
            return Err(ParseError::InvalidPath(format!("cannot push to {}", path)).into());
        }
        let nupkg = Self::pushed_package(headers, body)?;
        let spec = read_nuspec(&nupkg)?;
        let id = spec.id.to_lowercase();
        let version = normalize_version(&spec.version);

        let metadata = json!({
            "id": spec.id,
            "description": spec.description,
            "authors": spec.authors,
            "nuspec": spec.xml,
        });
        Ok(vec![UploadRequest::new(
            id.clone(),
            version.clone(),
            nupkg_name(&id, &version),
            nupkg,
        )
        .with_content_type("application/octet-stream")
        .with_metadata(metadata)])
    }

    async fn download(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        let path = path.trim_matches('/');
        if path == "v3/index.json" {
            return Ok(Some(RegistryResponse::json(
                200,
                &render_service_index(&ctx.base_url),
            )));
        }

        if let Some(rest) = path.strip_prefix(REGISTRATION) {
            let Some(id) = rest.strip_suffix("/index.json") else {
                return Ok(None);
            };
            let id = id.to_lowercase();
            let artifacts = ctx.db.list_artifacts(&ctx.repository.id, &id).await?;
            if artifacts.is_empty() {
                return Ok(None);
            }
            return Ok(Some(RegistryResponse::json(
                200,
                &render_registration(&ctx.base_url, &id, &artifacts),
            )));
        }

        let Some(rest) = path.strip_prefix(FLAT) else {
            return Ok(None);
        };
        let segments: Vec<String> = rest.split('/').map(str::to_lowercase).collect();
        match segments.as_slice() {
            [id, index] if index == "index.json" => {
                let artifacts = ctx.db.list_artifacts(&ctx.repository.id, id).await?;
                if artifacts.is_empty() {
                    return Ok(None);
                }
                let versions =
                    version::sorted_distinct(artifacts.iter().map(|a| a.version.as_str()));
                Ok(Some(RegistryResponse::json(200, &json!({ "versions": versions }))))
            }
            [id, ver, file] => {
                let ver = normalize_version(ver);
                if file.ends_with(".nuspec") {
                    let artifact = ctx
                        .db
                        .get_artifact(&ctx.repository.id, id, &ver, &nupkg_name(id, &ver))
                        .await?;
                    return Ok(artifact.and_then(|a| {
                        a.metadata["nuspec"].as_str().map(|xml| {
                            RegistryResponse::ok(xml.to_string()).with_content_type("application/xml")
                        })
                    }));
                }
                hosted::serve_file(ctx, id, &ver, file).await
            }
            _ => Ok(None),
        }
    }

    async fn proxy_fetch(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        // Clients must discover this repository's endpoints, not the upstream's
        if path.trim_matches('/') == "v3/index.json" {
            return Ok(Some(RegistryResponse::json(
                200,
                &render_service_index(&ctx.base_url),
            )));
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
        let path = format!("{}{}/index.json", FLAT, name.to_lowercase());
        let Some(doc) = self.proxy_fetch(ctx, &path).await? else {
            return Ok(Vec::new());
        };
        let doc: Value = serde_json::from_slice(&doc.body)
            .map_err(|e| PluginError::Serialization(format!("upstream version index: {}", e)))?;
        let versions: Vec<&str> = doc["versions"]
            .as_array()
            .map(|v| v.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        Ok(version::sorted_distinct(versions))
    }

    fn upstream_request(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<UpstreamRequest>, PluginError> {
        let path = path.trim_matches('/').to_lowercase();
        let upstream_path = match path.strip_prefix(REGISTRATION) {
            Some(rest) => format!("{}{}", UPSTREAM_REGISTRATION, rest),
            None => path.clone(),
        };
        let addressing = if path.starts_with(FLAT) && path.ends_with(".nupkg") {
            Addressing::Immutable
        } else {
            Addressing::Mutable
        };
        let url = ctx.upstream_join(&upstream_path)?;
        Ok(Some(UpstreamRequest::new(path, url, addressing)))
    }

    fn parse_delete(&self, path: &str) -> Option<(String, String)> {
        let rest = path.trim_matches('/').strip_prefix(PUBLISH)?;
        let mut segments = rest.trim_start_matches('/').split('/');
        let id = segments.next().filter(|s| !s.is_empty())?;
        let ver = segments.next().filter(|s| !s.is_empty())?;
        Some((id.to_lowercase(), normalize_version(ver)))
    }
}
