//! In-memory cache index
//!
//! Maps (repository, cache key) to its [`CacheEntry`]. The index is derived
//! state: every entry is mirrored by a `.meta.json` sidecar next to its bytes
//! and [`CacheIndex::rebuild`] recovers it after a restart.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::CacheEntry;
use crate::error::CacheError;
use crate::storage::{cache_prefix, Storage};

/// Suffix of sidecar metadata keys
pub const META_SUFFIX: &str = ".meta.json";

type IndexKey = (String, String);

/// Freshness records of every cached resource
#[derive(Default)]
pub struct CacheIndex {
    entries: RwLock<HashMap<IndexKey, CacheEntry>>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage key of a cache key's bytes
    ///
    /// Keys are base64url-encoded so arbitrary upstream paths map to one
    /// flat, collision-free segment.
    pub fn storage_key(repository_id: &str, cache_key: &str) -> String {
        format!(
            "{}{}",
            cache_prefix(repository_id),
            URL_SAFE_NO_PAD.encode(cache_key.as_bytes())
        )
    }

    pub async fn get(&self, repository_id: &str, cache_key: &str) -> Option<CacheEntry> {
        self.entries
            .read()
            .await
            .get(&(repository_id.to_string(), cache_key.to_string()))
            .cloned()
    }

    pub async fn insert(&self, entry: CacheEntry) {
        let key = (entry.repository_id.clone(), entry.cache_key.clone());
        self.entries.write().await.insert(key, entry);
    }

    pub async fn remove(&self, repository_id: &str, cache_key: &str) -> Option<CacheEntry> {
        self.entries
            .write()
            .await
            .remove(&(repository_id.to_string(), cache_key.to_string()))
    }

    /// Mark an entry as freshly confirmed, returning the updated record
    pub async fn touch(
        &self,
        repository_id: &str,
        cache_key: &str,
        at: DateTime<Utc>,
    ) -> Option<CacheEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&(repository_id.to_string(), cache_key.to_string()))?;
        entry.fetched_at = at;
        Some(entry.clone())
    }

    /// Entries of one repository, oldest fetch first
    pub async fn entries_for(&self, repository_id: &str) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.repository_id == repository_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.fetched_at);
        entries
    }

    /// Drop every entry of a repository, returning what was removed
    pub async fn remove_repository(&self, repository_id: &str) -> Vec<CacheEntry> {
        let mut entries = self.entries.write().await;
        let keys: Vec<IndexKey> = entries
            .keys()
            .filter(|(repo, _)| repo == repository_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| entries.remove(&k))
            .collect()
    }

    /// Repository ids with at least one entry
    pub async fn repositories(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .await
            .keys()
            .map(|(repo, _)| repo.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Persist an entry's sidecar next to its bytes
    pub async fn write_sidecar(storage: &dyn Storage, entry: &CacheEntry) -> Result<(), CacheError> {
        let json =
            serde_json::to_vec(entry).map_err(|e| CacheError::Serialization(e.to_string()))?;
        storage.put(&entry.meta_key(), Bytes::from(json)).await?;
        Ok(())
    }

    /// Reload a repository's entries from their sidecars
    ///
    /// Sidecars whose bytes are gone, or that no longer decode, are skipped.
    /// Returns the number of entries recovered.
    pub async fn rebuild(
        &self,
        repository_id: &str,
        storage: &dyn Storage,
    ) -> Result<usize, CacheError> {
        let keys = storage.list(&cache_prefix(repository_id)).await?;
        let mut recovered = 0;

        for meta_key in keys.iter().filter(|k| k.ends_with(META_SUFFIX)) {
            let Some(raw) = storage.get(meta_key).await? else {
                continue;
            };
            let entry: CacheEntry = match serde_json::from_slice(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(key = %meta_key, error = %e, "Skipping unreadable cache sidecar");
                    continue;
                }
            };
            if entry.repository_id != repository_id {
                continue;
            }
            if storage.size(&entry.storage_key).await?.is_none() {
                debug!(key = %entry.storage_key, "Cache sidecar without bytes");
                continue;
            }
            self.insert(entry).await;
            recovered += 1;
        }

        Ok(recovered)
    }
}
