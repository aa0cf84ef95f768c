//! HTTP client for upstream registries
//!
//! Supports conditional GETs with ETag and Last-Modified, and resolves
//! `WWW-Authenticate: Bearer` challenges by exchanging for a token at the
//! advertised realm. Only the repository's configured upstream credentials
//! are ever sent upstream.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED, RETRY_AFTER, WWW_AUTHENTICATE,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::retry::RetryManager;
use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::models::UpstreamAuth;

const DEFAULT_TOKEN_TTL_SECS: u64 = 60;
const RATE_LIMIT_FALLBACK_SECS: u64 = 30;

/// Per-request knobs
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Accept header values, sent comma-joined
    pub accept: Vec<String>,
    /// Validator from the cached copy
    pub etag: Option<String>,
    /// Validator from the cached copy
    pub last_modified: Option<String>,
    /// Configured upstream credentials
    pub auth: Option<UpstreamAuth>,
}

/// Body and validators of a 200 response
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamBody {
    pub body: Bytes,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    /// `Docker-Content-Digest` when the upstream sent one
    pub digest: Option<String>,
}

/// Outcome of a conditional GET
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamResponse {
    /// 304, the cached copy is current
    NotModified,
    /// 200 with fresh content
    Modified(UpstreamBody),
}

/// Parameters of a `WWW-Authenticate: Bearer` challenge
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Parse `Bearer realm="...",service="...",scope="..."`
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let params = parse_auth_params(params);
        Some(Self {
            realm: params.get("realm")?.clone(),
            service: params.get("service").cloned(),
            scope: params.get("scope").cloned(),
        })
    }
}

/// Split `key="value",key2=value2` respecting commas inside quotes
fn parse_auth_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            value = quoted[..end].to_string();
            rest = quoted.get(end + 1..).unwrap_or("");
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }
        rest = rest.trim_start().trim_start_matches(',').trim_start();
        params.insert(key, value);
    }
    params
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Upstream HTTP client with bearer token exchange
pub struct UpstreamClient {
    client: Client,
    retry: RetryManager,
    tokens: Mutex<HashMap<BearerChallenge, CachedToken>>,
}

impl UpstreamClient {
    /// Build a client with the configured timeouts and retry policy
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("artifact-depot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        Ok(Self::with_client(client, RetryManager::new(config.retry.clone())))
    }

    pub fn with_client(client: Client, retry: RetryManager) -> Self {
        Self {
            client,
            retry,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Conditional GET with retries for transient failures
    pub async fn get(&self, url: &str, opts: &FetchOptions) -> Result<UpstreamResponse, UpstreamError> {
        self.retry.execute(|| self.get_once(url, opts)).await
    }

    /// Reachability check; any non-5xx answer (including 401) counts as up
    pub async fn ping(&self, url: &str) -> Result<(), UpstreamError> {
        let response = self.client.get(url).send().await.map_err(map_reqwest_error)?;
        if response.status().is_server_error() {
            return Err(UpstreamError::ServerError(response.status().as_u16()));
        }
        Ok(())
    }

    async fn get_once(&self, url: &str, opts: &FetchOptions) -> Result<UpstreamResponse, UpstreamError> {
        debug!(url, "Fetching from upstream");

        let response = self.send(url, opts, None).await?;
        let response = if response.status() == StatusCode::UNAUTHORIZED {
            match challenge_of(&response) {
                Some(challenge) => {
                    let token = self.token_for(&challenge, opts.auth.as_ref()).await?;
                    let retried = self.send(url, opts, Some(&token)).await?;
                    if retried.status() == StatusCode::UNAUTHORIZED {
                        // The cached token may have been revoked early
                        self.tokens.lock().await.remove(&challenge);
                    }
                    retried
                }
                None => response,
            }
        } else {
            response
        };

        into_upstream_response(url, response).await
    }

    async fn send(
        &self,
        url: &str,
        opts: &FetchOptions,
        bearer: Option<&str>,
    ) -> Result<Response, UpstreamError> {
        let mut headers = HeaderMap::new();
        if !opts.accept.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&opts.accept.join(", ")) {
                headers.insert(ACCEPT, value);
            }
        }
        if let Some(etag) = opts.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(IF_NONE_MATCH, etag);
        }
        if let Some(lm) = opts
            .last_modified
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(IF_MODIFIED_SINCE, lm);
        }

        let mut request: RequestBuilder = self.client.get(url).headers(headers);
        request = match (bearer, &opts.auth) {
            (Some(token), _) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            (None, Some(auth)) => request.basic_auth(&auth.username, Some(&auth.password)),
            (None, None) => request,
        };

        request.send().await.map_err(map_reqwest_error)
    }

    /// Token for a challenge, exchanging at the realm when none is cached
    async fn token_for(
        &self,
        challenge: &BearerChallenge,
        auth: Option<&UpstreamAuth>,
    ) -> Result<String, UpstreamError> {
        if let Some(cached) = self.tokens.lock().await.get(challenge) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.value.clone());
            }
        }

        debug!(realm = %challenge.realm, scope = ?challenge.scope, "Exchanging upstream bearer token");

        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope));
        }
        let mut request = self.client.get(&challenge.realm).query(&query);
        if let Some(auth) = auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        if !response.status().is_success() {
            return Err(UpstreamError::TokenExchange(format!(
                "realm answered HTTP {}",
                response.status().as_u16()
            )));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::TokenExchange(e.to_string()))?;
        let value = body
            .token
            .or(body.access_token)
            .ok_or_else(|| UpstreamError::TokenExchange("no token in response".to_string()))?;

        let ttl = body.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        // Renew a little early so a token never expires mid-request
        let expires_at = Instant::now() + Duration::from_secs(ttl.saturating_sub(5).max(1));
        self.tokens.lock().await.insert(
            challenge.clone(),
            CachedToken {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(value)
    }
}

fn challenge_of(response: &Response) -> Option<BearerChallenge> {
    response
        .headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(BearerChallenge::parse)
}

fn header_string(headers: &HeaderMap, name: impl reqwest::header::AsHeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(String::from)
}

async fn into_upstream_response(url: &str, response: Response) -> Result<UpstreamResponse, UpstreamError> {
    let status = response.status();
    match status {
        StatusCode::NOT_MODIFIED => {
            debug!(url, "Upstream copy unchanged");
            Ok(UpstreamResponse::NotModified)
        }
        s if s.is_success() => {
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| UpstreamError::Network(e.to_string()))?;
            Ok(UpstreamResponse::Modified(UpstreamBody {
                body,
                etag: header_string(&headers, ETAG),
                last_modified: header_string(&headers, LAST_MODIFIED),
                content_type: header_string(&headers, CONTENT_TYPE),
                digest: header_string(&headers, "docker-content-digest"),
            }))
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(UpstreamError::NotFound),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            warn!(url, status = status.as_u16(), "Upstream refused credentials");
            Err(UpstreamError::Unauthorized)
        }
        StatusCode::TOO_MANY_REQUESTS => {
            let wait = header_string(response.headers(), RETRY_AFTER)
                .and_then(|v| v.parse().ok())
                .unwrap_or(RATE_LIMIT_FALLBACK_SECS);
            warn!(url, retry_after = wait, "Rate limited by upstream");
            Err(UpstreamError::RateLimited(wait))
        }
        s => {
            warn!(url, status = s.as_u16(), "Unexpected upstream status");
            Err(UpstreamError::ServerError(s.as_u16()))
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::NetworkTimeout
    } else if e.is_connect() {
        UpstreamError::ConnectionRefused
    } else {
        UpstreamError::Network(e.to_string())
    }
}
