//! Storage operations shared by every hosted repository

use bytes::Bytes;
use tracing::{info, warn};

use super::traits::{header, PluginContext, RegistryResponse, UploadRequest};
use crate::digest::ContentDigest;
use crate::error::{DbError, PluginError};
use crate::models::{Artifact, Provenance};
use crate::storage::repository_prefix;

/// Last path segment, safe to use as a storage key segment
pub fn file_name(path: &str) -> &str {
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() && name != "." && name != ".." => name,
        _ => "artifact",
    }
}

/// Store a file and record its row
///
/// Bytes go to a key unique to the new row, so a rejected or racing upload
/// never touches the bytes of the row already stored. Replaceable rows are
/// written with one atomic upsert; concurrent writers of the same row all
/// succeed and only the bytes of displaced rows are removed.
pub async fn hosted_upload(ctx: &PluginContext, req: UploadRequest) -> Result<Artifact, PluginError> {
    let repo = &ctx.repository;
    let digest = ContentDigest::compute(&req.body);
    if let Some(expected) = req.expected_digest {
        if expected != digest {
            return Err(PluginError::DigestMismatch {
                expected: expected.to_string(),
                actual: digest.to_string(),
            });
        }
    }

    let what = format!("{}@{} ({})", req.name, req.version, req.path);
    let replaceable = req.mutable || repo.config.allow_redeploy;
    let existing = ctx
        .db
        .get_artifact(&repo.id, &req.name, &req.version, &req.path)
        .await?;
    if let Some(existing) = &existing {
        if !replaceable {
            return Err(PluginError::AlreadyExists(what));
        }
        if existing.content_hash == digest.to_hex() && existing.metadata == req.metadata {
            return Ok(existing.clone());
        }
    }

    let size = req.body.len() as u64;
    let mut artifact = Artifact::new(&repo.id, &req.name, &req.version, &req.path)
        .with_content_type(req.content_type)
        .with_metadata(req.metadata)
        .with_provenance(req.provenance);
    let key = format!(
        "{}{}/{}",
        repository_prefix(&repo.id),
        artifact.id,
        file_name(&req.path)
    );
    artifact = artifact.with_content(key.clone(), digest.to_hex(), size);

    ctx.storage.put(&key, req.body).await?;

    let recorded = if replaceable {
        ctx.db.upsert_artifact(&artifact).await
    } else {
        ctx.db.insert_artifact(&artifact).await.map(|()| None)
    };
    let replaced = match recorded {
        Ok(replaced) => replaced,
        Err(e) => {
            if let Err(cleanup) = ctx.storage.delete(&key).await {
                warn!(key = %key, error = %cleanup, "Failed to discard bytes of rejected upload");
            }
            return Err(match e {
                DbError::ConstraintViolation(_) => PluginError::AlreadyExists(what),
                other => other.into(),
            });
        }
    };

    if let Some(old) = replaced.filter(|old| old.storage_key != key) {
        if let Err(e) = ctx.storage.delete(&old.storage_key).await {
            warn!(key = %old.storage_key, error = %e, "Failed to remove replaced bytes");
        }
    }

    info!(
        repository = %repo.name,
        package = %artifact.name,
        version = %artifact.version,
        path = %artifact.path,
        size,
        "Artifact stored"
    );
    Ok(artifact)
}

/// Remove a version's rows and their bytes
pub async fn hosted_delete(
    ctx: &PluginContext,
    name: &str,
    version: &str,
) -> Result<Vec<Artifact>, PluginError> {
    let removed = ctx
        .db
        .delete_version(&ctx.repository.id, name, version)
        .await?;
    if removed.is_empty() {
        return Err(PluginError::NotFound(format!("{}@{}", name, version)));
    }
    for artifact in &removed {
        if let Err(e) = ctx.storage.delete(&artifact.storage_key).await {
            warn!(key = %artifact.storage_key, error = %e, "Failed to remove artifact bytes");
        }
    }
    info!(
        repository = %ctx.repository.name,
        package = %name,
        version = %version,
        files = removed.len(),
        "Version deleted"
    );
    Ok(removed)
}

/// Bytes of a stored artifact; a row whose bytes vanished reads as absent
pub async fn load(ctx: &PluginContext, artifact: &Artifact) -> Result<Option<Bytes>, PluginError> {
    let bytes = ctx.storage.get(&artifact.storage_key).await?;
    if bytes.is_none() {
        warn!(
            repository = %ctx.repository.name,
            key = %artifact.storage_key,
            "Artifact row has no bytes"
        );
    }
    Ok(bytes)
}

/// Serve one stored file
pub async fn serve_file(
    ctx: &PluginContext,
    name: &str,
    version: &str,
    path: &str,
) -> Result<Option<RegistryResponse>, PluginError> {
    let Some(artifact) = ctx
        .db
        .get_artifact(&ctx.repository.id, name, version, path)
        .await?
    else {
        return Ok(None);
    };
    Ok(load(ctx, &artifact)
        .await?
        .map(|body| RegistryResponse::artifact(&artifact, body)))
}

/// Replace absolute upstream URLs in a text document with the repository URL
pub fn rewrite_urls(response: RegistryResponse, upstream: &str, base_url: &str) -> RegistryResponse {
    let upstream = upstream.trim_end_matches('/');
    if upstream.is_empty() {
        return response;
    }
    let Ok(text) = std::str::from_utf8(&response.body) else {
        return response;
    };
    if !text.contains(upstream) {
        return response;
    }
    let body = Bytes::from(text.replace(upstream, base_url.trim_end_matches('/')));
    RegistryResponse { body, ..response }
}

/// Provenance asserted through `X-Provenance-*` request headers
pub fn provenance_from_headers(headers: &[(String, String)]) -> Option<Provenance> {
    let provenance = Provenance {
        commit_sha: header(headers, "X-Provenance-Commit").map(String::from),
        build_id: header(headers, "X-Provenance-Build").map(String::from),
        source_repo_url: header(headers, "X-Provenance-Source").map(String::from),
    };
    (!provenance.is_empty()).then_some(provenance)
}


#[cfg(test)]
mod tests {
    use super::testing::hosted;
    use super::*;
    use crate::models::Manager;

    fn upload(body: &'static str) -> UploadRequest {
        UploadRequest::new("demo", "1.0.0", "demo-1.0.0.tgz", body)
    }

    // Test 1: upload stores bytes and a row
    #[tokio::test]
    async fn test_upload_and_serve() {
        let ctx = hosted(Manager::Raw).await;
        let artifact = hosted_upload(&ctx, upload("first")).await.unwrap();

        assert_eq!(artifact.content_hash, ContentDigest::compute(b"first").to_hex());
        assert_eq!(artifact.size, 5);
        assert!(artifact.storage_key.starts_with("repositories/"));

        let resp = serve_file(&ctx, "demo", "1.0.0", "demo-1.0.0.tgz")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.body, Bytes::from("first"));
    }

    // Test 2: duplicate version conflicts and leaves the first bytes alone
    #[tokio::test]
    async fn test_duplicate_conflicts() {
        let ctx = hosted(Manager::Raw).await;
        hosted_upload(&ctx, upload("first")).await.unwrap();

        let err = hosted_upload(&ctx, upload("second")).await.unwrap_err();
        assert!(matches!(err, PluginError::AlreadyExists(_)));

        let resp = serve_file(&ctx, "demo", "1.0.0", "demo-1.0.0.tgz")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.body, Bytes::from("first"));
    }

    // Test 3: mutable uploads replace bytes and drop the old key
    #[tokio::test]
    async fn test_mutable_replaces() {
        let ctx = hosted(Manager::Raw).await;
        let first = hosted_upload(&ctx, upload("first")).await.unwrap();
        let second = hosted_upload(&ctx, upload("second").mutable()).await.unwrap();

        assert_ne!(first.storage_key, second.storage_key);
        assert!(ctx.storage.get(&first.storage_key).await.unwrap().is_none());
        let resp = serve_file(&ctx, "demo", "1.0.0", "demo-1.0.0.tgz")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.body, Bytes::from("second"));
    }

    // Test 4: asserted digest must match
    #[tokio::test]
    async fn test_digest_mismatch_stores_nothing() {
        let ctx = hosted(Manager::Raw).await;
        let req = upload("payload").with_expected_digest(ContentDigest::compute(b"other"));
        let err = hosted_upload(&ctx, req).await.unwrap_err();
        assert!(matches!(err, PluginError::DigestMismatch { .. }));
        assert!(ctx
            .db
            .get_artifact(&ctx.repository.id, "demo", "1.0.0", "demo-1.0.0.tgz")
            .await
            .unwrap()
            .is_none());
    }

    // Test 5: delete removes rows and bytes; a second delete is NotFound
    #[tokio::test]
    async fn test_delete() {
        let ctx = hosted(Manager::Raw).await;
        let artifact = hosted_upload(&ctx, upload("bytes")).await.unwrap();

        let removed = hosted_delete(&ctx, "demo", "1.0.0").await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(ctx.storage.get(&artifact.storage_key).await.unwrap().is_none());

        let err = hosted_delete(&ctx, "demo", "1.0.0").await.unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    // Test 6: URL rewriting only touches text containing the upstream
    #[test]
    fn test_rewrite_urls() {
        let resp = RegistryResponse::ok(r#"{"tarball":"https://registry.npmjs.org/a/-/a-1.tgz"}"#);
        let out = rewrite_urls(resp, "https://registry.npmjs.org/", "http://me/repository/p");
        assert_eq!(
            out.body,
            Bytes::from(r#"{"tarball":"http://me/repository/p/a/-/a-1.tgz"}"#)
        );

        let binary = RegistryResponse::ok(vec![0xff, 0xfe]);
        let out = rewrite_urls(binary.clone(), "https://x", "http://y");
        assert_eq!(out, binary);
    }

    // Test 7: provenance headers and file names
    #[test]
    fn test_provenance_and_file_name() {
        let headers = vec![("x-provenance-commit".to_string(), "abc".to_string())];
        let p = provenance_from_headers(&headers).unwrap();
        assert_eq!(p.commit_sha, Some("abc".to_string()));
        assert!(provenance_from_headers(&[]).is_none());

        assert_eq!(file_name("a/b/c.jar"), "c.jar");
        assert_eq!(file_name("../.."), "artifact");
        assert_eq!(file_name(""), "artifact");
    }

    // Test 8: identical concurrent pushes of one mutable row all succeed
    #[tokio::test]
    async fn test_concurrent_mutable_uploads() {
        let ctx = hosted(Manager::Docker).await;
        let uploads = (0..4).map(|_| hosted_upload(&ctx, upload("layer").mutable()));
        let results = futures::future::join_all(uploads).await;
        assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);

        let stored = ctx
            .db
            .get_artifact(&ctx.repository.id, "demo", "1.0.0", "demo-1.0.0.tgz")
            .await
            .unwrap()
            .unwrap();
        let resp = serve_file(&ctx, "demo", "1.0.0", "demo-1.0.0.tgz")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.body, Bytes::from("layer"));

        // Bytes of the displaced rows are gone
        let keys = ctx
            .storage
            .list(&repository_prefix(&ctx.repository.id))
            .await
            .unwrap();
        assert_eq!(keys, vec![stored.storage_key]);
    }
}
