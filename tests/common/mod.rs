//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tempfile::TempDir;

use artifact_depot::auth::{
    hash_token, AllowAll, AuthManager, DatabasePermissions, PermissionChecker,
    RegistryTokenIssuer, TracingAuditSink,
};
use artifact_depot::config::{AuthConfig, CacheConfig, ContainerConfig, ServerConfig};
use artifact_depot::container::ListenerAccess;
use artifact_depot::database::{Database, SqliteDatabase};
use artifact_depot::plugins::cache::ProxyCache;
use artifact_depot::router::RepositoryRouter;
use artifact_depot::server::{AppState, Server};
use artifact_depot::storage::StorageSet;
use artifact_depot::upstream::{RetryManager, UpstreamClient};

/// Admin password used when authentication is enabled
pub const ADMIN_PASSWORD: &str = "admin-secret";

/// A fully wired depot over in-memory storage and database
pub struct TestDepot {
    pub state: AppState,
    pub router: Arc<RepositoryRouter>,
    pub db: Arc<dyn Database>,
    pub cache: Arc<ProxyCache>,
    /// Keeps the upload spool alive
    pub uploads: TempDir,
}

/// Create an in-memory database for testing
pub async fn create_test_database() -> Arc<dyn Database> {
    Arc::new(
        SqliteDatabase::in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

/// Build a depot; with `auth_enabled` the admin logs in with [`ADMIN_PASSWORD`]
/// and anonymous callers may only read
pub async fn create_test_depot(auth_enabled: bool) -> TestDepot {
    let db = create_test_database().await;
    let storage = StorageSet::in_memory();
    let upstream = Arc::new(UpstreamClient::with_client(
        reqwest::Client::new(),
        RetryManager::disabled(),
    ));
    let cache = Arc::new(ProxyCache::new(storage.clone(), upstream, CacheConfig::default()));

    let auth = Arc::new(AuthManager::new(
        Arc::clone(&db),
        &AuthConfig {
            enabled: auth_enabled,
            admin_password_hash: Some(hash_token(ADMIN_PASSWORD).expect("hash")),
            anonymous_read: true,
            ..Default::default()
        },
    ));
    let grants = Arc::new(DatabasePermissions::new(Arc::clone(&db), true));
    let permissions: Arc<dyn PermissionChecker> = if auth_enabled {
        grants.clone()
    } else {
        Arc::new(AllowAll)
    };

    let uploads = TempDir::new().expect("Failed to create upload dir");
    let container = ContainerConfig {
        host: "127.0.0.1".to_string(),
        upload_dir: uploads.path().to_string_lossy().into_owned(),
        ..Default::default()
    };
    let access = ListenerAccess::new(
        Some(Arc::clone(&auth)),
        Arc::clone(&permissions),
        RegistryTokenIssuer::new(b"integration-key".to_vec(), "artifact-depot", 300),
        container.service_name.clone(),
    );
    let router = RepositoryRouter::new(Arc::clone(&db), storage, Arc::clone(&cache), "http://depot.test")
        .with_auth(Arc::clone(&auth))
        .with_listeners(container, access);

    let state = AppState {
        router: Arc::clone(&router),
        auth,
        permissions,
        grants: Some(grants),
        audit: Arc::new(TracingAuditSink),
    };

    TestDepot {
        state,
        router,
        db,
        cache,
        uploads,
    }
}

/// Run a test server in the background and return the address
///
/// The server shuts down when the returned sender fires or is dropped.
pub async fn run_test_server(state: AppState) -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Failed to get local address");
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let server = Server::new(ServerConfig::default(), state);
    tokio::spawn(async move {
        server
            .serve(listener, async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("Server error");
    });

    (addr, shutdown_tx)
}

/// `Authorization` value for Basic credentials
pub fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
}

/// `Authorization` value for the admin
pub fn admin_auth() -> String {
    basic_auth("admin", ADMIN_PASSWORD)
}

/// Create a repository through the API, returning the response body
pub async fn create_repository(
    client: &reqwest::Client,
    addr: SocketAddr,
    body: serde_json::Value,
) -> serde_json::Value {
    let response = client
        .post(format!("http://{}/api/repositories", addr))
        .header("authorization", admin_auth())
        .json(&body)
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 201, "repository creation failed");
    response.json().await.expect("Failed to parse JSON")
}
