//! HTTP middleware for artifact-depot
//!
//! This module provides middleware for:
//! - Principal extraction (API token or Basic credentials)
//! - Request tracing spans

use axum::{
    extract::{ConnectInfo, Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::time::Instant;

use crate::auth::Credentials;
use crate::error::{AuthError, RegistryError};
use crate::models::Principal;

use super::router::AppState;

/// Paths that never need a principal
const AUTH_SKIP_PATHS: &[&str] = &["/health"];

fn auth_failure(error: AuthError) -> Response {
    let error = match error {
        AuthError::RateLimited => {
            return (
                axum::http::StatusCode::TOO_MANY_REQUESTS,
                axum::Json(serde_json::json!({
                    "error": "Too many failed attempts. Please try again later.",
                    "code": "RATE_LIMITED"
                })),
            )
                .into_response()
        }
        other => RegistryError::Unauthorized(other.to_string()),
    };
    error.into_response()
}

/// Attach the caller's [`Principal`] to the request
///
/// Requests without an Authorization header proceed as the anonymous
/// principal; permission checks decide what anonymous callers may do.
/// Credentials that are present but invalid are refused here.
pub async fn principal_middleware(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if AUTH_SKIP_PATHS.iter().any(|p| path.starts_with(p)) || !state.auth.is_enabled() {
        request.extensions_mut().insert(Principal::anonymous());
        return next.run(request).await;
    }

    let client_ip = connect.map(|ConnectInfo(addr)| addr.ip());
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let principal = match header_value {
        None => Principal::anonymous(),
        Some(value) => {
            let authenticated = match Credentials::parse(&value) {
                Ok(credentials) => state.auth.authenticate(&credentials, client_ip).await,
                Err(e) => Err(e),
            };
            match authenticated {
                Ok(principal) => principal,
                Err(e) => {
                    tracing::debug!(error = %e, path = %request.uri().path(), "Authentication failed");
                    return auth_failure(e);
                }
            }
        }
    };

    request.extensions_mut().insert(principal);
    next.run(request).await
}

/// Wrap each request in a span and log its outcome
pub async fn tracing_middleware(request: Request, next: Next) -> Response {
    use tracing::Instrument;

    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let span = tracing::info_span!(
        "http_request",
        http.method = %method,
        http.url = %uri,
        http.status_code = tracing::field::Empty,
    );

    async move {
        let response = next.run(request).await;
        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());
        tracing::info!(
            method = %method,
            path = %uri.path(),
            status = status.as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Request completed"
        );
        response
    }
    .instrument(span)
    .await
}
