//! Freshness decisions, upstream fetches and eviction

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::flight::{Flight, FlightMap};
use super::index::CacheIndex;
use super::{Addressing, CacheEntry, CacheSource, CacheStats, CachedResponse, UpstreamRequest};
use crate::config::CacheConfig;
use crate::digest::ContentDigest;
use crate::error::{CacheError, UpstreamError};
use crate::models::{Repository, RepositoryType};
use crate::otel::Metrics;
use crate::storage::{cache_prefix, Storage, StorageSet};
use crate::upstream::{FetchOptions, UpstreamBody, UpstreamClient, UpstreamResponse};

type FetchResult = Result<Option<CachedResponse>, CacheError>;

/// Eviction limits for one repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    /// Entries fetched longer ago than this are removed
    pub retention: Duration,
    /// At most this many entries are kept, newest first
    pub max_entries: usize,
}

impl SweepPolicy {
    /// Global defaults overridden by the repository's cache settings
    pub fn for_repository(defaults: &CacheConfig, repo: &Repository) -> Self {
        Self {
            retention: Duration::from_secs(
                repo.config
                    .cache
                    .retention_secs
                    .unwrap_or(defaults.retention_secs),
            ),
            max_entries: repo.config.cache.max_entries.unwrap_or(defaults.max_entries),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Counters {
    hits: u64,
    misses: u64,
    revalidations: u64,
    upstream_fetches: u64,
    stale_serves: u64,
    coalesced_waits: u64,
    evictions: u64,
}

/// Pull-through cache shared by every proxy repository
pub struct ProxyCache {
    storage: StorageSet,
    upstream: Arc<UpstreamClient>,
    index: CacheIndex,
    flights: FlightMap<(String, String), FetchResult>,
    counters: Mutex<HashMap<String, Counters>>,
    defaults: CacheConfig,
    metrics: Option<Arc<Metrics>>,
}

impl ProxyCache {
    pub fn new(storage: StorageSet, upstream: Arc<UpstreamClient>, defaults: CacheConfig) -> Self {
        Self {
            storage,
            upstream,
            index: CacheIndex::new(),
            flights: FlightMap::new(),
            counters: Mutex::new(HashMap::new()),
            defaults,
            metrics: None,
        }
    }

    /// Report counters through OpenTelemetry as well
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    /// Recover the index of every proxy repository from its sidecars
    pub async fn rebuild(&self, repos: &[Repository]) -> Result<usize, CacheError> {
        let mut total = 0;
        for repo in repos.iter().filter(|r| r.repo_type == RepositoryType::Proxy) {
            let storage = self.storage.for_repository(repo)?;
            let recovered = self.index.rebuild(&repo.id, storage.as_ref()).await?;
            if recovered > 0 {
                info!(repository = %repo.name, entries = recovered, "Cache index rebuilt");
            }
            total += recovered;
        }
        Ok(total)
    }

    /// Return bytes for a proxy repository's resource
    ///
    /// `Ok(None)` means upstream does not have it and nothing is cached.
    pub async fn fetch(&self, repo: &Repository, req: &UpstreamRequest) -> FetchResult {
        if req.addressing == Addressing::Immutable {
            if let Some(hit) = self.cached(repo, &req.cache_key).await? {
                return Ok(Some(hit));
            }
        }

        let key = (repo.id.clone(), req.cache_key.clone());
        loop {
            match self.flights.join(key.clone()) {
                Flight::Leader(guard) => {
                    let result = self.fill(repo, req).await;
                    guard.complete(result.clone());
                    return result;
                }
                Flight::Follower(mut rx) => {
                    self.count(&repo.id, |c| c.coalesced_waits += 1);
                    if let Some(m) = &self.metrics {
                        m.record_coalesced(&repo.name);
                    }
                    match rx.recv().await {
                        Ok(result) => return result,
                        Err(_) => {
                            debug!(repository = %repo.name, key = %req.cache_key, "Leader abandoned fetch; retrying");
                        }
                    }
                }
            }
        }
    }

    /// Serve an immutable entry straight from storage
    async fn cached(&self, repo: &Repository, cache_key: &str) -> Result<Option<CachedResponse>, CacheError> {
        let Some(entry) = self.index.get(&repo.id, cache_key).await else {
            return Ok(None);
        };
        let storage = self.storage.for_repository(repo)?;
        match storage.get(&entry.storage_key).await? {
            Some(body) => {
                self.count(&repo.id, |c| c.hits += 1);
                if let Some(m) = &self.metrics {
                    m.record_cache_hit(&repo.name);
                }
                Ok(Some(respond(&entry, body, CacheSource::Hit)))
            }
            None => {
                // Bytes vanished underneath the index
                self.index.remove(&repo.id, cache_key).await;
                Ok(None)
            }
        }
    }

    /// Leader path: consult upstream and update the cache
    async fn fill(&self, repo: &Repository, req: &UpstreamRequest) -> FetchResult {
        let storage = self.storage.for_repository(repo)?;

        match req.addressing {
            Addressing::Immutable => {
                // Another leader may have filled it while we queued
                if let Some(hit) = self.cached(repo, &req.cache_key).await? {
                    return Ok(Some(hit));
                }
                self.count(&repo.id, |c| c.misses += 1);
                if let Some(m) = &self.metrics {
                    m.record_cache_miss(&repo.name);
                }

                match self.call_upstream(repo, req, FetchOptions::default()).await {
                    Ok(UpstreamResponse::Modified(body)) => {
                        self.store(repo, storage.as_ref(), req, body).await.map(Some)
                    }
                    Ok(UpstreamResponse::NotModified) => Err(CacheError::Upstream(
                        UpstreamError::InvalidData("304 to an unconditional request".to_string()),
                    )),
                    Err(UpstreamError::NotFound) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Addressing::Mutable => {
                let cached = match self.index.get(&repo.id, &req.cache_key).await {
                    Some(entry) => storage
                        .get(&entry.storage_key)
                        .await?
                        .map(|body| (entry, body)),
                    None => None,
                };

                let opts = FetchOptions {
                    etag: cached.as_ref().and_then(|(e, _)| e.etag.clone()),
                    last_modified: cached.as_ref().and_then(|(e, _)| e.last_modified.clone()),
                    ..FetchOptions::default()
                };
                if cached.is_none() {
                    self.count(&repo.id, |c| c.misses += 1);
                    if let Some(m) = &self.metrics {
                        m.record_cache_miss(&repo.name);
                    }
                }

                match (self.call_upstream(repo, req, opts).await, cached) {
                    (Ok(UpstreamResponse::Modified(body)), _) => {
                        self.store(repo, storage.as_ref(), req, body).await.map(Some)
                    }
                    (Ok(UpstreamResponse::NotModified), Some((entry, body))) => {
                        let entry = self
                            .index
                            .touch(&repo.id, &req.cache_key, Utc::now())
                            .await
                            .unwrap_or(entry);
                        if let Err(e) = CacheIndex::write_sidecar(storage.as_ref(), &entry).await {
                            warn!(repository = %repo.name, error = %e, "Failed to refresh cache sidecar");
                        }
                        self.count(&repo.id, |c| c.revalidations += 1);
                        Ok(Some(respond(&entry, body, CacheSource::Revalidated)))
                    }
                    (Ok(UpstreamResponse::NotModified), None) => Err(CacheError::Upstream(
                        UpstreamError::InvalidData("304 without a cached copy".to_string()),
                    )),
                    (Err(UpstreamError::NotFound), _) => Ok(None),
                    (Err(e), Some((entry, body))) => {
                        warn!(
                            repository = %repo.name,
                            key = %req.cache_key,
                            error = %e,
                            "Upstream unavailable, serving stale copy"
                        );
                        self.count(&repo.id, |c| c.stale_serves += 1);
                        if let Some(m) = &self.metrics {
                            m.record_stale_serve(&repo.name);
                        }
                        Ok(Some(respond(&entry, body, CacheSource::Stale)))
                    }
                    (Err(e), None) => Err(e.into()),
                }
            }
        }
    }

    async fn call_upstream(
        &self,
        repo: &Repository,
        req: &UpstreamRequest,
        mut opts: FetchOptions,
    ) -> Result<UpstreamResponse, UpstreamError> {
        opts.accept = req.accept.clone();
        opts.auth = repo.config.upstream_auth.clone();

        self.count(&repo.id, |c| c.upstream_fetches += 1);
        let started = Instant::now();
        let result = self.upstream.get(&req.url, &opts).await;
        if let Some(m) = &self.metrics {
            m.record_upstream_fetch(&repo.name, started.elapsed().as_secs_f64());
        }
        result
    }

    /// Verify, persist and index a fresh upstream body
    async fn store(
        &self,
        repo: &Repository,
        storage: &dyn Storage,
        req: &UpstreamRequest,
        upstream: UpstreamBody,
    ) -> Result<CachedResponse, CacheError> {
        let digest = ContentDigest::compute(&upstream.body);
        if let Some(expected) = req.expected_digest {
            if expected != digest {
                warn!(
                    repository = %repo.name,
                    expected = %expected,
                    actual = %digest,
                    "Upstream body does not match its digest"
                );
                return Err(CacheError::Integrity(req.cache_key.clone()));
            }
        }

        let entry = CacheEntry {
            repository_id: repo.id.clone(),
            cache_key: req.cache_key.clone(),
            fetched_at: Utc::now(),
            ttl_secs: repo.config.cache.ttl_secs.unwrap_or(self.defaults.default_ttl_secs),
            storage_key: CacheIndex::storage_key(&repo.id, &req.cache_key),
            size: upstream.body.len() as u64,
            digest,
            etag: upstream.etag,
            last_modified: upstream.last_modified,
            content_type: upstream.content_type,
        };

        storage.put(&entry.storage_key, upstream.body.clone()).await?;
        CacheIndex::write_sidecar(storage, &entry).await?;
        self.index.insert(entry.clone()).await;

        debug!(repository = %repo.name, key = %req.cache_key, size = entry.size, "Cached upstream response");
        Ok(respond(&entry, upstream.body, CacheSource::Fetched))
    }

    /// Statistics of one repository
    pub async fn stats(&self, repository_id: &str) -> CacheStats {
        let entries = self.index.entries_for(repository_id).await;
        let now = Utc::now();
        let counters = self
            .lock_counters()
            .get(repository_id)
            .cloned()
            .unwrap_or_default();

        CacheStats {
            entries: entries.len() as u64,
            total_size_bytes: entries.iter().map(|e| e.size).sum(),
            expired_entries: entries.iter().filter(|e| e.is_expired(now)).count() as u64,
            hits: counters.hits,
            misses: counters.misses,
            revalidations: counters.revalidations,
            upstream_fetches: counters.upstream_fetches,
            stale_serves: counters.stale_serves,
            coalesced_waits: counters.coalesced_waits,
            evictions: counters.evictions,
        }
    }

    /// Drop every cached resource of a repository, returning the count
    pub async fn clear(&self, repo: &Repository) -> Result<usize, CacheError> {
        let storage = self.storage.for_repository(repo)?;
        let removed = self.index.remove_repository(&repo.id).await;

        // Sweep the prefix too, so bytes written by an interrupted fetch go as well
        for key in storage.list(&cache_prefix(&repo.id)).await? {
            storage.delete(&key).await?;
        }
        self.lock_counters().remove(&repo.id);

        info!(repository = %repo.name, entries = removed.len(), "Proxy cache cleared");
        Ok(removed.len())
    }

    /// Evict entries beyond each repository's retention window or entry ceiling
    ///
    /// Entries of repositories missing from `repos` are dropped as orphans.
    /// Returns the number of evicted entries.
    pub async fn sweep(&self, repos: &[Repository]) -> Result<usize, CacheError> {
        let mut evicted = 0;
        let now = Utc::now();

        for repo_id in self.index.repositories().await {
            let Some(repo) = repos.iter().find(|r| r.id == repo_id) else {
                let orphans = self.index.remove_repository(&repo_id).await;
                debug!(repository_id = %repo_id, entries = orphans.len(), "Dropped orphaned cache entries");
                continue;
            };
            let policy = SweepPolicy::for_repository(&self.defaults, repo);
            let storage = self.storage.for_repository(repo)?;

            let entries = self.index.entries_for(&repo.id).await;
            let retention = chrono::Duration::from_std(policy.retention)
                .unwrap_or_else(|_| chrono::Duration::days(36500));
            let overflow = entries.len().saturating_sub(policy.max_entries);

            // Oldest first, so the overflow victims are the head of the list
            let victims: Vec<&CacheEntry> = entries
                .iter()
                .enumerate()
                .filter(|(i, e)| *i < overflow || now - e.fetched_at > retention)
                .map(|(_, e)| e)
                .collect();

            for entry in victims {
                self.index.remove(&repo.id, &entry.cache_key).await;
                storage.delete(&entry.storage_key).await?;
                storage.delete(&entry.meta_key()).await?;
                evicted += 1;
                self.count(&repo.id, |c| c.evictions += 1);
            }
        }

        if evicted > 0 {
            info!(evicted, "Cache sweep complete");
            if let Some(m) = &self.metrics {
                m.record_evictions(evicted as u64);
            }
        }
        Ok(evicted)
    }

    fn lock_counters(&self) -> MutexGuard<'_, HashMap<String, Counters>> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn count(&self, repository_id: &str, update: impl FnOnce(&mut Counters)) {
        update(
            self.lock_counters()
                .entry(repository_id.to_string())
                .or_default(),
        );
    }
}

fn respond(entry: &CacheEntry, body: Bytes, source: CacheSource) -> CachedResponse {
    CachedResponse {
        body,
        content_type: entry.content_type.clone(),
        digest: entry.digest,
        source,
    }
}
