//! Raw file plugin
//!
//! Any path is a package whose name is the path itself and whose single
//! version is `-`. A path ending in `/` lists the files below it.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use crate::error::{ParseError, PluginError};
use crate::models::Manager;
use crate::plugins::cache::{Addressing, UpstreamRequest};

use super::hosted;
use super::traits::{header, PluginContext, RegistryPlugin, RegistryResponse, UploadRequest};

/// Version every raw file is stored under
pub const RAW_VERSION: &str = "-";

/// Normalized file path: no leading or trailing slash, no empty or dot segments
pub fn normalize_path(path: &str) -> Result<String, ParseError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(ParseError::MissingParameter("file path".to_string()));
    }
    if trimmed
        .split('/')
        .any(|s| s.is_empty() || s == "." || s == "..")
    {
        return Err(ParseError::InvalidPath(path.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Raw file plugin
#[derive(Debug, Default)]
pub struct RawPlugin;

impl RawPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RegistryPlugin for RawPlugin {
    fn manager(&self) -> Manager {
        Manager::Raw
    }

    fn canonical_name(&self, name: &str) -> String {
        name.trim_matches('/').to_string()
    }

    fn parse_upload(
        &self,
        path: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<Vec<UploadRequest>, PluginError> {
        let name = normalize_path(path)?;
        let file = hosted::file_name(&name).to_string();
        let content_type = header(headers, "content-type")
            .map(String::from)
            .unwrap_or_else(|| mime_guess::from_path(&name).first_or_octet_stream().to_string());
        Ok(vec![UploadRequest::new(name, RAW_VERSION, file, body).with_content_type(content_type)])
    }

    async fn download(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<RegistryResponse>, PluginError> {
        if path.is_empty() || path.ends_with('/') {
            let prefix = path.trim_start_matches('/');
            let files: Vec<Value> = ctx
                .db
                .list_package_names(&ctx.repository.id)
                .await?
                .into_iter()
                .filter(|n| n.starts_with(prefix))
                .map(|n| json!({ "path": n, "url": format!("{}/{}", ctx.base_url, n) }))
                .collect();
            if files.is_empty() && !prefix.is_empty() {
                return Ok(None);
            }
            return Ok(Some(RegistryResponse::json(200, &json!({ "files": files }))));
        }
        let Ok(name) = normalize_path(path) else {
            return Ok(None);
        };
        let file = hosted::file_name(&name).to_string();
        hosted::serve_file(ctx, &name, RAW_VERSION, &file).await
    }

    async fn proxy_versions(&self, ctx: &PluginContext, name: &str) -> Result<Vec<String>, PluginError> {
        Ok(match self.proxy_fetch(ctx, name).await? {
            Some(_) => vec![RAW_VERSION.to_string()],
            None => Vec::new(),
        })
    }

    fn upstream_request(
        &self,
        ctx: &PluginContext,
        path: &str,
    ) -> Result<Option<UpstreamRequest>, PluginError> {
        let Ok(name) = normalize_path(path) else {
            return Ok(None);
        };
        let url = ctx.upstream_join(&name)?;
        Ok(Some(UpstreamRequest::new(name, url, Addressing::Mutable)))
    }

    fn rewrite_proxied(
        &self,
        _ctx: &PluginContext,
        _req: &UpstreamRequest,
        response: RegistryResponse,
    ) -> Result<RegistryResponse, PluginError> {
        Ok(response)
    }

    fn parse_delete(&self, path: &str) -> Option<(String, String)> {
        normalize_path(path)
            .ok()
            .map(|name| (name, RAW_VERSION.to_string()))
    }
}
