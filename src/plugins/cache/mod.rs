//! Proxy cache engine
//!
//! Shared by every proxy repository. Bytes always live in [`Storage`]; the
//! in-memory [`CacheIndex`] only records freshness facts and is rebuilt from
//! sidecar files at startup.
//!
//! [`Storage`]: crate::storage::Storage

pub mod engine;
pub mod flight;
pub mod index;
pub mod sweeper;

pub use engine::{ProxyCache, SweepPolicy};
pub use flight::{Flight, FlightGuard, FlightMap};
pub use index::CacheIndex;
pub use sweeper::spawn_sweeper;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;

/// How an upstream resource is identified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Addressing {
    /// Identified by its content hash; never revalidated once cached
    Immutable,
    /// Identified by a tag or name; revalidated on every request
    Mutable,
}

/// What to fetch and how to treat it, as decided by the ecosystem plugin
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    /// Index key: the upstream path, or the digest for digest-addressed resources
    pub cache_key: String,
    /// Absolute upstream URL
    pub url: String,
    pub addressing: Addressing,
    /// Accept header values
    pub accept: Vec<String>,
    /// Digest the body must hash to, when known in advance
    pub expected_digest: Option<ContentDigest>,
}

impl UpstreamRequest {
    pub fn new(cache_key: impl Into<String>, url: impl Into<String>, addressing: Addressing) -> Self {
        Self {
            cache_key: cache_key.into(),
            url: url.into(),
            addressing,
            accept: Vec::new(),
            expected_digest: None,
        }
    }

    /// A digest-addressed request whose body is verified against the digest
    pub fn by_digest(digest: ContentDigest, url: impl Into<String>) -> Self {
        Self {
            expected_digest: Some(digest),
            ..Self::new(digest.to_string(), url, Addressing::Immutable)
        }
    }

    pub fn with_accept<I, S>(mut self, accept: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accept = accept.into_iter().map(Into::into).collect();
        self
    }
}

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    /// Served from cache without contacting upstream
    Hit,
    /// Fetched from upstream and stored
    Fetched,
    /// Upstream confirmed the cached copy is current
    Revalidated,
    /// Upstream failed; served the cached copy anyway
    Stale,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::Hit => "hit",
            CacheSource::Fetched => "fetched",
            CacheSource::Revalidated => "revalidated",
            CacheSource::Stale => "stale",
        }
    }
}

/// Bytes handed back to the plugin
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub digest: ContentDigest,
    pub source: CacheSource,
}

/// Freshness record of one cached resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub repository_id: String,
    pub cache_key: String,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub storage_key: String,
    pub size: u64,
    pub digest: ContentDigest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl CacheEntry {
    /// Whether the entry has outlived its TTL
    ///
    /// Informational only: mutable entries are revalidated regardless and
    /// immutable entries never go stale.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.fetched_at).num_seconds() > self.ttl_secs as i64
    }

    /// Storage key of the sidecar metadata file
    pub fn meta_key(&self) -> String {
        format!("{}{}", self.storage_key, index::META_SUFFIX)
    }
}

/// Per-repository cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_size_bytes: u64,
    pub expired_entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub revalidations: u64,
    pub upstream_fetches: u64,
    pub stale_serves: u64,
    pub coalesced_waits: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Share of requests answered without a full upstream download
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.revalidations + self.stale_serves;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: hit rate counts revalidated and stale copies as served
    #[test]
    fn test_hit_rate() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
        let stats = CacheStats {
            hits: 2,
            revalidations: 1,
            stale_serves: 1,
            misses: 4,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    // Test 2: digest requests carry their expected digest and key
    #[test]
    fn test_by_digest() {
        let digest = ContentDigest::compute(b"layer");
        let req = UpstreamRequest::by_digest(digest, "https://up/v2/a/blobs/x");
        assert_eq!(req.addressing, Addressing::Immutable);
        assert_eq!(req.cache_key, digest.to_string());
        assert_eq!(req.expected_digest, Some(digest));
    }

    // Test 3: expiry is measured from fetch time
    #[test]
    fn test_entry_expiry() {
        let entry = CacheEntry {
            repository_id: "r".into(),
            cache_key: "k".into(),
            fetched_at: Utc::now() - chrono::Duration::seconds(120),
            ttl_secs: 60,
            storage_key: "proxy-cache/r/aw".into(),
            size: 1,
            digest: ContentDigest::compute(b"x"),
            etag: None,
            last_modified: None,
            content_type: None,
        };
        assert!(entry.is_expired(Utc::now()));
        assert!(!entry.is_expired(entry.fetched_at));
        assert_eq!(entry.meta_key(), "proxy-cache/r/aw.meta.json");
    }
}
