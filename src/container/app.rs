//! HTTP surface of one registry listener
//!
//! Every request is resolved against the listener's repository and handed to
//! the repository router under a `v2/...` path, so hosted, proxy and group
//! repositories behave exactly as they do through the main API. Only blob
//! upload sessions and token issuance live here.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::auth::{Credentials, Scope};
use crate::digest::ContentDigest;
use crate::error::{ParseError, RegistryError};
use crate::models::{Action, Repository};
use crate::plugins::registry::docker::{is_valid_name, parse_docker_path, DockerPath};
use crate::plugins::registry::{NativeMethod, RegistryResponse};
use crate::router::RepositoryRouter;

use super::auth::{Caller, ListenerAccess};
use super::uploads::{UploadError, UploadSessions};

/// Header announcing the protocol version on every response
pub const API_VERSION_HEADER: &str = "docker-distribution-api-version";

/// State shared by the handlers of one listener
pub struct ListenerState {
    pub repository_id: String,
    pub router: Weak<RepositoryRouter>,
    pub sessions: Arc<UploadSessions>,
    pub access: Arc<ListenerAccess>,
    pub protocol_version: String,
}

/// Build the axum app served by one listener
pub fn listener_app(state: ListenerState) -> Router {
    let version = HeaderValue::from_str(&state.protocol_version)
        .unwrap_or_else(|_| HeaderValue::from_static("registry/2.0"));
    let body_limit = usize::try_from(state.sessions.max_blob_bytes()).unwrap_or(usize::MAX);
    Router::new()
        .route("/v2", any(dispatch))
        .route("/v2/", any(dispatch))
        .route("/v2/token", get(token_get).post(token_post))
        .route("/v2/*rest", any(dispatch))
        .with_state(Arc::new(state))
        .layer(middleware::map_response_with_state(version, stamp_version))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}

async fn stamp_version(State(version): State<HeaderValue>, mut response: Response) -> Response {
    response.headers_mut().insert(API_VERSION_HEADER, version);
    response
}

// =============================================================================
// Errors
// =============================================================================

/// Error in the registry protocol's `{"errors": [...]}` shape
#[derive(Debug, Clone, PartialEq)]
pub struct OciError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub challenge: Option<String>,
}

/// What a failing request was about, for choosing an error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subject {
    Name,
    Manifest,
    Blob,
    Upload,
}

impl OciError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            challenge: None,
        }
    }

    fn with_challenge(mut self, challenge: String) -> Self {
        self.challenge = Some(challenge);
        self
    }

    fn unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "UNAVAILABLE",
            "registry is shutting down",
        )
    }

    fn from_registry(err: RegistryError, subject: Subject) -> Self {
        let message = err.to_string();
        match err {
            RegistryError::NotFound(_) => match subject {
                Subject::Manifest => Self::new(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", message),
                Subject::Blob => Self::new(StatusCode::NOT_FOUND, "BLOB_UNKNOWN", message),
                Subject::Upload => Self::new(StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN", message),
                Subject::Name => Self::new(StatusCode::NOT_FOUND, "NAME_UNKNOWN", message),
            },
            RegistryError::DigestMismatch { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "DIGEST_INVALID", message)
            }
            RegistryError::InvalidRequest(_) => match subject {
                Subject::Manifest => Self::new(StatusCode::BAD_REQUEST, "MANIFEST_INVALID", message),
                Subject::Blob | Subject::Upload => {
                    Self::new(StatusCode::BAD_REQUEST, "BLOB_UPLOAD_INVALID", message)
                }
                Subject::Name => Self::new(StatusCode::BAD_REQUEST, "NAME_INVALID", message),
            },
            RegistryError::Unauthorized(_) => Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message),
            RegistryError::Forbidden(_) => Self::new(StatusCode::FORBIDDEN, "DENIED", message),
            RegistryError::Conflict(_) => Self::new(StatusCode::CONFLICT, "DENIED", message),
            RegistryError::WriteRejected(_) | RegistryError::Unsupported(_) => {
                Self::new(StatusCode::METHOD_NOT_ALLOWED, "UNSUPPORTED", message)
            }
            RegistryError::UpstreamUnavailable(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "UNKNOWN", message)
            }
            RegistryError::Internal(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN", message)
            }
        }
    }
}

impl From<UploadError> for OciError {
    fn from(err: UploadError) -> Self {
        let message = err.to_string();
        match err {
            UploadError::UnknownSession(_) => {
                Self::new(StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN", message)
            }
            UploadError::RangeInvalid { .. } => {
                Self::new(StatusCode::RANGE_NOT_SATISFIABLE, "RANGE_INVALID", message)
            }
            UploadError::DigestMismatch { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "DIGEST_INVALID", message)
            }
            UploadError::TooLarge { .. } => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, "SIZE_INVALID", message)
            }
            UploadError::Io(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN", message),
        }
    }
}

impl IntoResponse for OciError {
    fn into_response(self) -> Response {
        let body = json!({
            "errors": [{ "code": self.code, "message": self.message, "detail": null }]
        });
        let mut response = (self.status, Json(body)).into_response();
        if let Some(value) = self
            .challenge
            .and_then(|c| HeaderValue::from_str(&c).ok())
        {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

// =============================================================================
// Routing
// =============================================================================

/// A request path below `/v2/`
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    /// `/v2/{name}/blobs/uploads/[{session}]`
    Upload { name: String, session: Option<String> },
    /// Anything the container plugin understands
    Registry(DockerPath),
}

impl Route {
    fn parse(rest: &str) -> Result<Self, OciError> {
        if let Some(pos) = rest.find("/blobs/uploads") {
            let name = &rest[..pos];
            if !is_valid_name(name) {
                return Err(OciError::new(StatusCode::BAD_REQUEST, "NAME_INVALID", format!("invalid image name: {}", name)));
            }
            let tail = rest[pos + "/blobs/uploads".len()..].trim_matches('/');
            return Ok(Route::Upload {
                name: name.to_string(),
                session: (!tail.is_empty()).then(|| tail.to_string()),
            });
        }
        match parse_docker_path(rest) {
            Ok(path) => Ok(Route::Registry(path)),
            Err(ParseError::InvalidPackageName(name)) => Err(OciError::new(
                StatusCode::BAD_REQUEST,
                "NAME_INVALID",
                format!("invalid image name: {}", name),
            )),
            Err(e) if rest.contains("/blobs/") => {
                Err(OciError::new(StatusCode::BAD_REQUEST, "DIGEST_INVALID", e.to_string()))
            }
            Err(e) => Err(OciError::new(StatusCode::NOT_FOUND, "NAME_UNKNOWN", e.to_string())),
        }
    }

    fn image(&self) -> Option<&str> {
        match self {
            Route::Upload { name, .. } => Some(name),
            Route::Registry(DockerPath::Manifest { name, .. })
            | Route::Registry(DockerPath::Blob { name, .. })
            | Route::Registry(DockerPath::TagList { name }) => Some(name),
            Route::Registry(DockerPath::VersionCheck) | Route::Registry(DockerPath::Catalog) => None,
        }
    }

    fn subject(&self) -> Subject {
        match self {
            Route::Upload { .. } => Subject::Upload,
            Route::Registry(DockerPath::Manifest { .. }) => Subject::Manifest,
            Route::Registry(DockerPath::Blob { .. }) => Subject::Blob,
            Route::Registry(_) => Subject::Name,
        }
    }

    fn action(&self, method: &Method) -> Action {
        match (self, method) {
            (_, &Method::GET) | (_, &Method::HEAD) => Action::Read,
            (Route::Registry(_), &Method::DELETE) => Action::Delete,
            _ => Action::Write,
        }
    }
}

/// `{scheme}://{host}` the client used to reach this listener
fn external_base(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{}://{}", scheme, host)
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect()
}

fn query_value<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
    query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

/// First offset of a `Content-Range` header (`0-1023`, `bytes 0-1023/*`)
fn range_start(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let raw = raw.trim().trim_start_matches("bytes").trim_start_matches(['=', ' ']);
    raw.split('-').next()?.trim().parse().ok()
}

fn session_location(name: &str, id: &str) -> String {
    format!("/v2/{}/blobs/uploads/{}", name, id)
}

fn upload_progress(status: StatusCode, name: &str, id: &str, received: u64) -> Response {
    let range = format!("0-{}", received.saturating_sub(1));
    let mut response = status.into_response();
    let headers = response.headers_mut();
    for (key, value) in [
        (header::LOCATION, session_location(name, id)),
        (header::RANGE, range),
        (HeaderName::from_static("docker-upload-uuid"), id.to_string()),
        (header::CONTENT_LENGTH, "0".to_string()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(key, value);
        }
    }
    response
}

// =============================================================================
// Handlers
// =============================================================================

struct Request {
    ip: Option<IpAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    body: Bytes,
}

async fn dispatch(
    State(state): State<Arc<ListenerState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<Vec<(String, String)>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = Request {
        ip: connect.map(|ConnectInfo(addr)| addr.ip()),
        method,
        uri,
        headers,
        query,
        body,
    };
    match handle(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            if e.status.is_server_error() {
                warn!(repository_id = %state.repository_id, code = e.code, error = %e.message, "Registry request failed");
            }
            e.into_response()
        }
    }
}

async fn resolve(state: &ListenerState) -> Result<(Arc<RepositoryRouter>, Repository), OciError> {
    let router = state.router.upgrade().ok_or_else(OciError::unavailable)?;
    let repo = router
        .get_repository(&state.repository_id)
        .await
        .map_err(|e| OciError::from_registry(e, Subject::Name))?
        .ok_or_else(|| OciError::new(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "repository no longer exists"))?;
    Ok((router, repo))
}

async fn handle(state: &ListenerState, req: Request) -> Result<Response, OciError> {
    let (router, repo) = resolve(state).await?;
    let rest = req.uri.path().trim_start_matches("/v2").trim_start_matches('/');
    let route = Route::parse(rest)?;
    let action = route.action(&req.method);
    let image = route.image().map(String::from);

    let challenge = |err: RegistryError| {
        let unauthorized = matches!(err, RegistryError::Unauthorized(_));
        let e = OciError::from_registry(err, Subject::Name);
        if unauthorized {
            e.with_challenge(state.access.challenge(&external_base(&req.headers), image.as_deref(), action))
        } else {
            e
        }
    };
    let caller = state
        .access
        .identify(&repo, &req.headers, req.ip)
        .await
        .map_err(&challenge)?;
    state
        .access
        .authorize(&caller, &repo, image.as_deref(), action)
        .await
        .map_err(&challenge)?;

    match route {
        Route::Upload { name, session } => upload(state, &router, &repo, &req, &name, session).await,
        Route::Registry(path) => registry(&router, &repo, &req, path, rest).await,
    }
}

async fn registry(
    router: &RepositoryRouter,
    repo: &Repository,
    req: &Request,
    path: DockerPath,
    rest: &str,
) -> Result<Response, OciError> {
    let subject = Route::Registry(path.clone()).subject();
    let plugin_path = format!("v2/{}", rest);
    let fail = |e: RegistryError| OciError::from_registry(e, subject);

    match req.method {
        Method::GET | Method::HEAD => {
            let not_found = || OciError::from_registry(RegistryError::NotFound(rest.to_string()), subject);
            let response = router
                .download(&repo.id, &plugin_path)
                .await
                .map_err(fail)?
                .ok_or_else(not_found)?;
            if req.method == Method::HEAD {
                Ok(response.head().into_response())
            } else {
                Ok(response.into_response())
            }
        }
        Method::PUT if matches!(path, DockerPath::Manifest { .. }) => {
            let response = router
                .upload_raw(&repo.id, NativeMethod::Put, &plugin_path, &header_pairs(&req.headers), req.body.clone())
                .await
                .map_err(fail)?;
            Ok(response.into_response())
        }
        Method::DELETE if matches!(path, DockerPath::Manifest { .. }) => {
            router
                .upload_raw(&repo.id, NativeMethod::Delete, &plugin_path, &[], Bytes::new())
                .await
                .map_err(fail)?;
            Ok(RegistryResponse::new(202, Bytes::new()).into_response())
        }
        _ => Err(OciError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "UNSUPPORTED",
            format!("{} is not supported on {}", req.method, rest),
        )),
    }
}

async fn upload(
    state: &ListenerState,
    router: &RepositoryRouter,
    repo: &Repository,
    req: &Request,
    name: &str,
    session: Option<String>,
) -> Result<Response, OciError> {
    let sessions = &state.sessions;
    let fail = |e: RegistryError| OciError::from_registry(e, Subject::Upload);

    match (&req.method, session) {
        (&Method::POST, None) => {
            let target = router.write_target(repo).await.map_err(fail)?;

            // Monolithic upload: the whole blob in one request
            if let Some(digest) = query_value(&req.query, "digest") {
                return commit(router, &target, name, digest, req.body.clone()).await;
            }

            let status = sessions.initiate(&target.id, name).await?;
            if !req.body.is_empty() {
                sessions
                    .append(&target.id, name, &status.id, Some(0), req.body.clone())
                    .await?;
            }
            debug!(repository = %repo.name, image = name, upload = %status.id, "Blob upload started");
            Ok(upload_progress(StatusCode::ACCEPTED, name, &status.id, req.body.len() as u64))
        }
        (&Method::PATCH, Some(id)) => {
            let target = router.write_target(repo).await.map_err(fail)?;
            let status = sessions
                .append(&target.id, name, &id, range_start(&req.headers), req.body.clone())
                .await?;
            Ok(upload_progress(StatusCode::ACCEPTED, name, &id, status.bytes_received))
        }
        (&Method::PUT, Some(id)) => {
            let target = router.write_target(repo).await.map_err(fail)?;
            let digest = query_value(&req.query, "digest").ok_or_else(|| {
                OciError::new(StatusCode::BAD_REQUEST, "DIGEST_INVALID", "digest parameter is required")
            })?;
            let expected: ContentDigest = digest
                .parse()
                .map_err(|e: ParseError| OciError::new(StatusCode::BAD_REQUEST, "DIGEST_INVALID", e.to_string()))?;
            let bytes = sessions
                .finalize(&target.id, name, &id, expected, req.body.clone())
                .await?;
            commit(router, &target, name, digest, bytes).await
        }
        (&Method::GET, Some(id)) => {
            let target = router.write_target(repo).await.map_err(fail)?;
            let status = sessions.status(&target.id, name, &id).await?;
            Ok(upload_progress(StatusCode::NO_CONTENT, name, &id, status.bytes_received))
        }
        (&Method::DELETE, Some(id)) => {
            let target = router.write_target(repo).await.map_err(fail)?;
            sessions.cancel(&target.id, name, &id).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        (method, _) => Err(OciError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "UNSUPPORTED",
            format!("{} is not supported on blob uploads", method),
        )),
    }
}

/// Store finished blob bytes under their digest
async fn commit(
    router: &RepositoryRouter,
    target: &Repository,
    name: &str,
    digest: &str,
    bytes: Bytes,
) -> Result<Response, OciError> {
    let path = format!("v2/{}/blobs/{}", name, digest);
    let response = router
        .upload_raw(&target.id, NativeMethod::Put, &path, &[], bytes)
        .await
        .map_err(|e| OciError::from_registry(e, Subject::Blob))?;
    Ok(response.into_response())
}

// =============================================================================
// Token endpoint
// =============================================================================

fn requested_scopes<'a>(values: impl Iterator<Item = &'a str>) -> Vec<Scope> {
    values
        .flat_map(|v| v.split(' '))
        .filter(|v| !v.is_empty())
        .filter_map(|v| Scope::parse(v).ok())
        .collect()
}

async fn token_get(
    State(state): State<Arc<ListenerState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    let ip = connect.map(|ConnectInfo(addr)| addr.ip());
    let result = async {
        let (_, repo) = resolve(&state).await?;
        let caller = state
            .access
            .identify(&repo, &headers, ip)
            .await
            .map_err(|e| unauthorized_token(&state, &headers, e))?;
        let scopes = requested_scopes(
            query.iter().filter(|(k, _)| k == "scope").map(|(_, v)| v.as_str()),
        );
        issue(&state, &caller, &repo, scopes).await
    }
    .await;
    result.unwrap_or_else(IntoResponse::into_response)
}

async fn token_post(
    State(state): State<Arc<ListenerState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    axum::Form(form): axum::Form<Vec<(String, String)>>,
) -> Response {
    let ip = connect.map(|ConnectInfo(addr)| addr.ip());
    let result = async {
        let (_, repo) = resolve(&state).await?;
        let credentials = match query_value(&form, "grant_type") {
            Some("password") => Some(Credentials::Basic {
                username: query_value(&form, "username").unwrap_or_default().to_string(),
                password: query_value(&form, "password").unwrap_or_default().to_string(),
            }),
            Some("refresh_token") => {
                query_value(&form, "refresh_token").map(|t| Credentials::Bearer(t.to_string()))
            }
            _ => None,
        };
        let caller = match credentials {
            Some(credentials) => state.access.identify_credentials(&repo, &credentials, ip).await,
            None => state.access.identify(&repo, &headers, ip).await,
        }
        .map_err(|e| unauthorized_token(&state, &headers, e))?;
        let scopes = requested_scopes(query_value(&form, "scope").into_iter());
        issue(&state, &caller, &repo, scopes).await
    }
    .await;
    result.unwrap_or_else(IntoResponse::into_response)
}

fn unauthorized_token(state: &ListenerState, headers: &HeaderMap, err: RegistryError) -> OciError {
    OciError::from_registry(err, Subject::Name)
        .with_challenge(state.access.challenge(&external_base(headers), None, Action::Read))
}

async fn issue(
    state: &ListenerState,
    caller: &Caller,
    repo: &Repository,
    scopes: Vec<Scope>,
) -> Result<Response, OciError> {
    let issued = state
        .access
        .issue(caller, repo, scopes)
        .await
        .map_err(|e| OciError::from_registry(e, Subject::Name))?;
    debug!(repository = %repo.name, principal = %caller.principal().name, "Issued registry token");
    Ok(Json(issued).into_response())
}
