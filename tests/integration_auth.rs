//! Authentication flow integration tests
//!
//! Tests the authentication system including:
//! - Admin Basic authentication
//! - API token issue, use and revocation
//! - Permission grants on repository writes
//! - Anonymous reads and repositories that require credentials
//! - Rate limiting of repeated failures

mod common;

use common::*;
use reqwest::StatusCode;
use serde_json::{json, Value};

/// Test 1: admin credentials gate the management API
#[tokio::test]
async fn test_admin_basic_auth() {
    let depot = create_test_depot(true).await;
    let (addr, _shutdown) = run_test_server(depot.state.clone()).await;
    let client = reqwest::Client::new();

    let anonymous = client
        .post(format!("http://{}/api/repositories", addr))
        .json(&json!({ "name": "files", "type": "hosted", "manager": "raw" }))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let wrong = client
        .get(format!("http://{}/api/tokens", addr))
        .header("authorization", basic_auth("admin", "not-it"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert!(wrong.headers().contains_key("www-authenticate"));

    let listed = client
        .get(format!("http://{}/api/tokens", addr))
        .header("authorization", admin_auth())
        .send()
        .await
        .unwrap();
    assert_eq!(listed.status(), StatusCode::OK);

    create_repository(
        &client,
        addr,
        json!({ "name": "files", "type": "hosted", "manager": "raw" }),
    )
    .await;
}

/// Test 2: a token writes only after a grant and stops working once revoked
#[tokio::test]
async fn test_token_lifecycle() {
    let depot = create_test_depot(true).await;
    let (addr, _shutdown) = run_test_server(depot.state.clone()).await;
    let client = reqwest::Client::new();

    create_repository(
        &client,
        addr,
        json!({ "name": "files", "type": "hosted", "manager": "raw" }),
    )
    .await;

    let created: Value = client
        .post(format!("http://{}/api/tokens", addr))
        .header("authorization", admin_auth())
        .json(&json!({ "name": "deploy", "principal": "deployer" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = created["token"].as_str().unwrap().to_string();
    let token_id = created["id"].as_str().unwrap().to_string();
    let bearer = format!("Bearer {}", token);

    let upload = |body: &'static [u8]| {
        client
            .put(format!("http://{}/repository/files/dist/app.bin", addr))
            .header("authorization", bearer.clone())
            .body(body)
            .send()
    };

    assert_eq!(upload(b"v1").await.unwrap().status(), StatusCode::FORBIDDEN);

    let granted = client
        .post(format!("http://{}/api/permissions", addr))
        .header("authorization", admin_auth())
        .json(&json!({ "principal": "deployer", "action": "write", "repository_id": "files" }))
        .send()
        .await
        .unwrap();
    assert_eq!(granted.status(), StatusCode::CREATED);

    assert!(upload(b"v1").await.unwrap().status().is_success());

    // Listings never carry the stored hash
    let tokens: Value = client
        .get(format!("http://{}/api/tokens", addr))
        .header("authorization", admin_auth())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let listed = &tokens["tokens"][0];
    assert_eq!(listed["principal"], "deployer");
    assert!(listed.get("token_hash").is_none());
    assert!(listed.get("token").is_none());

    let grants: Value = client
        .get(format!("http://{}/api/permissions?principal=deployer", addr))
        .header("authorization", admin_auth())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(grants["grants"].as_array().unwrap().len(), 1);

    let revoked = client
        .delete(format!("http://{}/api/tokens/{}", addr, token_id))
        .header("authorization", admin_auth())
        .send()
        .await
        .unwrap();
    assert_eq!(revoked.status(), StatusCode::OK);

    assert_eq!(upload(b"v2").await.unwrap().status(), StatusCode::UNAUTHORIZED);
}

/// Test 3: anonymous callers read public repositories and nothing else
#[tokio::test]
async fn test_anonymous_access() {
    let depot = create_test_depot(true).await;
    let (addr, _shutdown) = run_test_server(depot.state.clone()).await;
    let client = reqwest::Client::new();

    create_repository(
        &client,
        addr,
        json!({ "name": "public", "type": "hosted", "manager": "raw" }),
    )
    .await;
    create_repository(
        &client,
        addr,
        json!({
            "name": "private",
            "type": "hosted",
            "manager": "raw",
            "config": { "auth_required": true }
        }),
    )
    .await;

    for repo in ["public", "private"] {
        let stored = client
            .put(format!("http://{}/repository/{}/readme.txt", addr, repo))
            .header("authorization", admin_auth())
            .body("hello")
            .send()
            .await
            .unwrap();
        assert!(stored.status().is_success());
    }

    let public = client
        .get(format!("http://{}/repository/public/readme.txt", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(public.status(), StatusCode::OK);
    assert_eq!(public.text().await.unwrap(), "hello");

    let private = client
        .get(format!("http://{}/repository/private/readme.txt", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(private.status(), StatusCode::UNAUTHORIZED);

    let admin_read = client
        .get(format!("http://{}/repository/private/readme.txt", addr))
        .header("authorization", admin_auth())
        .send()
        .await
        .unwrap();
    assert_eq!(admin_read.status(), StatusCode::OK);

    let write = client
        .put(format!("http://{}/repository/public/other.txt", addr))
        .body("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(write.status(), StatusCode::UNAUTHORIZED);
}

/// Test 4: repeated failures from one address are throttled
#[tokio::test]
async fn test_rate_limiting() {
    let depot = create_test_depot(true).await;
    let (addr, _shutdown) = run_test_server(depot.state.clone()).await;
    let client = reqwest::Client::new();

    let mut statuses = Vec::new();
    for _ in 0..12 {
        let response = client
            .get(format!("http://{}/api/repositories", addr))
            .header("authorization", basic_auth("admin", "guess"))
            .send()
            .await
            .unwrap();
        statuses.push(response.status());
    }
    assert_eq!(statuses[0], StatusCode::UNAUTHORIZED);
    assert_eq!(*statuses.last().unwrap(), StatusCode::TOO_MANY_REQUESTS);

    // Even the right password is refused while blocked
    let blocked = client
        .get(format!("http://{}/api/repositories", addr))
        .header("authorization", admin_auth())
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);
}
