//! Maven 2 repository layout plugin
//!
//! Layout: `{group/as/path}/{artifactId}/{version}/{artifactId}-{version}[-classifier].{ext}`
//! with `maven-metadata.xml` per artifact and `.sha1` / `.sha256` checksum
//! siblings for every file. Packages are named `groupId:artifactId`.

use async_trait::async_trait;
use quick_xml::escape::escape;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::digest::{sha1_hex, ContentDigest};
use crate::error::{ParseError, PluginError};
use crate::models::{Artifact, Manager};
use crate::plugins::cache::{Addressing, UpstreamRequest};

use super::hosted;
use super::traits::{PluginContext, RegistryPlugin, RegistryResponse, UploadRequest};
use super::version;

const METADATA_FILE: &str = "maven-metadata.xml";
const SNAPSHOT_SUFFIX: &str = "-SNAPSHOT";

/// Checksum flavours served next to every file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    Sha1,
    Sha256,
}

impl Checksum {
    fn split(file: &str) -> (&str, Option<Checksum>) {
        if let Some(base) = file.strip_suffix(".sha1") {
            (base, Some(Checksum::Sha1))
        } else if let Some(base) = file.strip_suffix(".sha256") {
            (base, Some(Checksum::Sha256))
        } else {
            (file, None)
        }
    }

    fn of(&self, data: &[u8]) -> String {
        match self {
            Checksum::Sha1 => sha1_hex(data),
            Checksum::Sha256 => ContentDigest::compute(data).to_hex(),
        }
    }
}

/// What a request path addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MavenPath {
    /// `{g}/{a}/maven-metadata.xml`
    Metadata {
        group_id: String,
        artifact_id: String,
        checksum: Option<Checksum>,
    },
    /// `{g}/{a}/{v}/{file}`
    File {
        group_id: String,
        artifact_id: String,
        version: String,
        file: String,
        checksum: Option<Checksum>,
    },
}

impl MavenPath {
    /// Parse a repository-relative path
    pub fn parse(path: &str) -> Result<Self, ParseError> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
            return Err(ParseError::InvalidPath(path.to_string()));
        }
        let Some(&last) = segments.last() else {
            return Err(ParseError::InvalidPath(path.to_string()));
        };
        let (file, checksum) = Checksum::split(last);
        let n = segments.len();

        if file == METADATA_FILE && n >= 3 && !segments[n - 2].ends_with(SNAPSHOT_SUFFIX) {
            return Ok(MavenPath::Metadata {
                group_id: segments[..n - 2].join("."),
                artifact_id: segments[n - 2].to_string(),
                checksum,
            });
        }
        if n < 4 {
            return Err(ParseError::InvalidPath(format!(
                "expected group/artifact/version/file: {}",
                path
            )));
        }
        Ok(MavenPath::File {
            group_id: segments[..n - 3].join("."),
            artifact_id: segments[n - 3].to_string(),
            version: segments[n - 2].to_string(),
            file: file.to_string(),
            checksum,
        })
    }
}

/// `groupId:artifactId`
pub fn coordinates(group_id: &str, artifact_id: &str) -> String {
    format!("{}:{}", group_id, artifact_id)
}

/// Directory of a `groupId:artifactId` package
pub fn package_dir(name: &str) -> Result<String, ParseError> {
    let (group, artifact) = name
        .split_once(':')
        .ok_or_else(|| ParseError::InvalidPackageName(format!("expected groupId:artifactId, got {}", name)))?;
    Ok(format!("{}/{}", group.replace('.', "/"), artifact))
}

pub fn is_snapshot(version: &str) -> bool {
    version.ends_with(SNAPSHOT_SUFFIX)
}

/// The artifact-level `maven-metadata.xml`
pub fn render_metadata(
    group_id: &str,
    artifact_id: &str,
    versions: &[String],
    last_updated: DateTime<Utc>,
) -> String {
    let latest = versions.last().cloned().unwrap_or_default();
    let release = versions
        .iter()
        .rev()
        .find(|v| !is_snapshot(v))
        .cloned()
        .unwrap_or_default();

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<metadata>\n");
    xml.push_str(&format!("  <groupId>{}</groupId>\n", escape(group_id)));
    xml.push_str(&format!("  <artifactId>{}</artifactId>\n", escape(artifact_id)));
    xml.push_str("  <versioning>\n");
    xml.push_str(&format!("    <latest>{}</latest>\n", escape(&latest)));
    if !release.is_empty() {
        xml.push_str(&format!("    <release>{}</release>\n", escape(&release)));
    }
    xml.push_str("    <versions>\n");
    for v in versions {
        xml.push_str(&format!("      <version>{}</version>\n", escape(v)));
    }
    xml.push_str("    </versions>\n");
    xml.push_str(&format!(
        "    <lastUpdated>{}</lastUpdated>\n",
        last_updated.format("%Y%m%d%H%M%S")
    ));
    xml.push_str("  </versioning>\n</metadata>\n");
    xml
}

/// `<version>` values of a metadata document
pub fn parse_metadata_versions(xml: &str) -> Vec<String> {
    let mut versions = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<version>") {
        rest = &rest[start + "<version>".len()..];
        let Some(end) = rest.find("</version>") else {
            break;
        };
        versions.push(rest[..end].trim().to_string());
        rest = &rest[end..];
    }
    versions
}

fn content_type_of(file: &str) -> &'static str {
    match file.rsplit('.').next() {
        Some("pom") | Some("xml") => "application/xml",
        Some("jar") | Some("war") | Some("ear") => "application/java-archive",
        Some("module") | Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

fn checksum_response(value: String) -> RegistryResponse {
    RegistryResponse::ok(value).with_content_type("text/plain")
}

/// Maven repository plugin
#[derive(Debug, Default)]
pub struct MavenPlugin;

impl MavenPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RegistryPlugin for MavenPlugin {
    fn manager(&self) -> Manager {
        Manager::Maven
    }

    fn parse_upload(
        &self,
        path: &str,
        _headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Vec<UploadRequest>, PluginError> {
        match MavenPath::parse(path)? {
            // Rendered from the stored versions; checksums are generated
            MavenPath::Metadata { .. } => Ok(Vec::new()),
            MavenPath::File { checksum: Some(_), .. } => Ok(Vec::new()),
            MavenPath::File {
                group_id,
                artifact_id,
                version,
                file,
                checksum: None,
            } => {
                let snapshot = is_snapshot(&version);
                if file == METADATA_FILE {
                    // Snapshot builds publish their own version-level metadata
                    return Ok(vec![UploadRequest::new(
                        coordinates(&group_id, &artifact_id),
                        version,
                        file,
                        body,
                    )
                    .with_content_type("application/xml")
                    .mutable()]);
                }
                if !file.starts_with(&format!("{}-", artifact_id)) {
                    return Err(ParseError::InvalidPath(format!(
                        "{} does not belong to artifact {}",
                        file, artifact_id
                    ))
                    .into());
                }

                let metadata = serde_json::json!({ "sha1": sha1_hex(&body) });
                let mut req = UploadRequest::new(
                    coordinates(&group_id, &artifact_id),
                    version,
                    file.clone(),
                    body,
                )
                .with_content_type(content_type_of(&file))
                .with_metadata(metadata);
                if snapshot {
                    req = req.mutable();
                }
                Ok(vec![req])
            }
        }
    }

    async fn download(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        match MavenPath::parse(path)? {
            MavenPath::Metadata {
                group_id,
                artifact_id,
                checksum,
            } => {
                let artifacts = ctx
                    .db
                    .list_artifacts(&ctx.repository.id, &coordinates(&group_id, &artifact_id))
                    .await?;
                let Some(last_updated) = artifacts.iter().map(|a| a.created_at).max() else {
                    return Ok(None);
                };
                let versions =
                    version::sorted_distinct(artifacts.iter().map(|a| a.version.as_str()));
                let xml = render_metadata(&group_id, &artifact_id, &versions, last_updated);
                Ok(Some(match checksum {
                    Some(c) => checksum_response(c.of(xml.as_bytes())),
                    None => RegistryResponse::ok(xml).with_content_type("application/xml"),
                }))
            }
            MavenPath::File {
                group_id,
                artifact_id,
                version,
                file,
                checksum,
            } => {
                let name = coordinates(&group_id, &artifact_id);
                let Some(artifact) = ctx
                    .db
                    .get_artifact(&ctx.repository.id, &name, &version, &file)
                    .await?
                else {
                    return Ok(None);
                };
                match checksum {
                    Some(Checksum::Sha256) => Ok(Some(checksum_response(artifact.content_hash))),
                    Some(Checksum::Sha1) => match artifact.metadata["sha1"].as_str() {
                        Some(sha1) => Ok(Some(checksum_response(sha1.to_string()))),
                        None => Ok(hosted::load(ctx, &artifact)
                            .await?
                            .map(|body| checksum_response(sha1_hex(&body)))),
                    },
                    None => Ok(hosted::load(ctx, &artifact)
                        .await?
                        .map(|body| RegistryResponse::artifact(&artifact, body))),
                }
            }
        }
    }

    async fn proxy_versions(&self, ctx: &PluginContext, name: &str) -> Result<Vec<String>, PluginError> {
        let path = format!("{}/{}", package_dir(name)?, METADATA_FILE);
        let Some(doc) = self.proxy_fetch(ctx, &path).await? else {
            return Ok(Vec::new());
        };
        let xml = String::from_utf8_lossy(&doc.body);
        let versions = parse_metadata_versions(&xml);
        Ok(version::sorted_distinct(versions.iter().map(String::as_str)))
    }

    fn upstream_request(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<UpstreamRequest>, PluginError> {
        let addressing = match MavenPath::parse(path)? {
            MavenPath::Metadata { .. } => Addressing::Mutable,
            MavenPath::File { file, .. } if file == METADATA_FILE => Addressing::Mutable,
            MavenPath::File { version, .. } if is_snapshot(&version) => Addressing::Mutable,
            // Released coordinates never change on a conforming repository
            MavenPath::File { .. } => Addressing::Immutable,
        };
        let key = path.trim_matches('/').to_string();
        let url = ctx.upstream_join(&key)?;
        Ok(Some(UpstreamRequest::new(key, url, addressing)))
    }

    /// Maven documents carry coordinates, not URLs
    fn rewrite_proxied(
        &self,
        _ctx: &PluginContext,
        _req: &UpstreamRequest,
        response: RegistryResponse,
    ) -> Result<RegistryResponse, PluginError> {
        Ok(response)
    }

    fn parse_delete(&self, path: &str) -> Option<(String, String)> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let n = segments.len();
        if n < 3 {
            return None;
        }
        // `{g}/{a}/{v}/{file}` or `{g}/{a}/{v}`
        let (artifact_idx, version_idx) =
            if n >= 4 && segments[n - 1].starts_with(&format!("{}-", segments[n - 3])) {
                (n - 3, n - 2)
            } else {
                (n - 2, n - 1)
            };
        Some((
            coordinates(&segments[..artifact_idx].join("."), segments[artifact_idx]),
            segments[version_idx].to_string(),
        ))
    }
}
