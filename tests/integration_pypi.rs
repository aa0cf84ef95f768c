//! PyPI repository integration tests
//!
//! Tests the PyPI repositories over HTTP including:
//! - twine uploads into a hosted repository
//! - The Simple API pages rendered from stored files
//! - Proxied pages and files read through the cache

mod common;

use common::*;
use reqwest::StatusCode;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BOUNDARY: &str = "depot-boundary";

/// A twine-style multipart form
fn twine_form(name: &str, version: &str, filename: &str, content: &[u8], sha256: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [
        (":action", "file_upload"),
        ("name", name),
        ("version", version),
        ("filetype", "sdist"),
        ("sha256_digest", sha256),
    ] {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, field, value
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"content\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            BOUNDARY, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn twine_upload(
    client: &reqwest::Client,
    addr: std::net::SocketAddr,
    repo: &str,
    form: Vec<u8>,
) -> reqwest::Response {
    client
        .post(format!("http://{}/repository/{}/", addr, repo))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(form)
        .send()
        .await
        .unwrap()
}

/// Test 1: twine upload, simple pages and the file download
#[tokio::test]
async fn test_pypi_hosted_upload() {
    let depot = create_test_depot(false).await;
    let (addr, _shutdown) = run_test_server(depot.state.clone()).await;
    let client = reqwest::Client::new();

    create_repository(
        &client,
        addr,
        json!({ "name": "pypi-hosted", "type": "hosted", "manager": "pypi" }),
    )
    .await;

    let content = b"sdist archive bytes";
    let sha256 = hex::encode(Sha256::digest(content));
    let uploaded = twine_upload(
        &client,
        addr,
        "pypi-hosted",
        twine_form("Demo_Pkg", "1.0", "demo_pkg-1.0.tar.gz", content, &sha256),
    )
    .await;
    assert!(uploaded.status().is_success(), "upload failed: {}", uploaded.status());

    let root = client
        .get(format!("http://{}/repository/pypi-hosted/simple/", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(root.contains("demo-pkg"));

    let page = client
        .get(format!("http://{}/repository/pypi-hosted/simple/demo.pkg/", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(page.status(), StatusCode::OK);
    let html = page.text().await.unwrap();
    assert!(html.contains(&format!(
        "http://depot.test/repository/pypi-hosted/packages/demo-pkg/1.0/demo_pkg-1.0.tar.gz#sha256={}",
        sha256
    )));

    let file = client
        .get(format!(
            "http://{}/repository/pypi-hosted/packages/demo-pkg/1.0/demo_pkg-1.0.tar.gz",
            addr
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(file.status(), StatusCode::OK);
    assert_eq!(file.bytes().await.unwrap().as_ref(), content);

    let versions: Value = client
        .get(format!(
            "http://{}/api/repositories/pypi-hosted/versions?name=demo-pkg",
            addr
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(versions["versions"], json!(["1.0"]));
}

/// Test 2: an upload whose bytes do not match the claimed digest is refused
#[tokio::test]
async fn test_pypi_digest_mismatch() {
    let depot = create_test_depot(false).await;
    let (addr, _shutdown) = run_test_server(depot.state.clone()).await;
    let client = reqwest::Client::new();

    create_repository(
        &client,
        addr,
        json!({ "name": "pypi-hosted", "type": "hosted", "manager": "pypi" }),
    )
    .await;

    let claimed = hex::encode(Sha256::digest(b"something else"));
    let uploaded = twine_upload(
        &client,
        addr,
        "pypi-hosted",
        twine_form("demo", "1.0", "demo-1.0.tar.gz", b"actual bytes", &claimed),
    )
    .await;
    assert_eq!(uploaded.status(), StatusCode::BAD_REQUEST);

    let page = client
        .get(format!("http://{}/repository/pypi-hosted/simple/demo/", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(page.status(), StatusCode::NOT_FOUND);
}

/// Test 3: proxied files come back through the repository and the cache
#[tokio::test]
async fn test_pypi_proxy_through_cache() {
    let depot = create_test_depot(false).await;
    let (addr, _shutdown) = run_test_server(depot.state.clone()).await;
    let client = reqwest::Client::new();

    let upstream = MockServer::start().await;
    let files = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/simple/demo/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<a href=\"{}/packages/ab/cd/demo-1.0.tar.gz#sha256=00\">demo-1.0.tar.gz</a>",
            files.uri()
        )))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/packages/ab/cd/demo-1.0.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"proxied sdist".to_vec()))
        .expect(1)
        .mount(&files)
        .await;

    create_repository(
        &client,
        addr,
        json!({
            "name": "pypi-proxy",
            "type": "proxy",
            "manager": "pypi",
            "config": {
                "upstream_url": upstream.uri(),
                "extra": { "files_url": files.uri() }
            }
        }),
    )
    .await;

    let html = client
        .get(format!("http://{}/repository/pypi-proxy/simple/demo/", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let link = "http://depot.test/repository/pypi-proxy/files/packages/ab/cd/demo-1.0.tar.gz";
    assert!(html.contains(link), "link not rewritten: {}", html);

    for _ in 0..2 {
        let file = client
            .get(format!(
                "http://{}/repository/pypi-proxy/files/packages/ab/cd/demo-1.0.tar.gz",
                addr
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(file.status(), StatusCode::OK);
        assert_eq!(file.bytes().await.unwrap().as_ref(), b"proxied sdist");
    }
    files.verify().await;

    let stats: Value = client
        .get(format!("http://{}/api/repositories/pypi-proxy/cache", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(stats["entries"].as_u64().unwrap() >= 1);
    assert!(stats["hits"].as_u64().unwrap() >= 1);

    let cleared: Value = client
        .delete(format!("http://{}/api/repositories/pypi-proxy/cache", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(cleared["cleared"].as_u64().unwrap() >= 1);
    let stats = depot.router.cache_stats("pypi-proxy").await.unwrap();
    assert_eq!(stats.entries, 0);
}
