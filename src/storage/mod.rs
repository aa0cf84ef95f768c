//! Artifact byte storage
//!
//! Storage is an opaque key/value byte store. Keys are slash-separated
//! relative paths. Repositories use the default backend unless their config
//! names another one, and whole prefixes can be migrated between backends.

pub mod filesystem;
pub mod memory;

pub use filesystem::FilesystemStorage;
pub use memory::MemoryStorage;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tracing::info;

use crate::config::{StorageBackendConfig, StorageConfig};
use crate::error::StorageError;
use crate::models::Repository;

/// Stream of stored bytes
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Byte store used for artifacts, cache entries and uploads
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store bytes under a key, replacing any previous value
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    /// Read all bytes of a key
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// Stream the bytes of a key
    async fn get_stream(&self, key: &str) -> Result<Option<ByteStream>, StorageError>;

    /// Size of a key, None if absent
    async fn size(&self, key: &str) -> Result<Option<u64>, StorageError>;

    /// Remove a key; removing an absent key succeeds
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Every key starting with the prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Reject keys that could escape a backend's namespace
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Prefix under which a repository's artifacts live
pub fn repository_prefix(repository_id: &str) -> String {
    format!("repositories/{}/", repository_id)
}

/// Prefix under which a proxy repository's cache entries live
pub fn cache_prefix(repository_id: &str) -> String {
    format!("proxy-cache/{}/", repository_id)
}

/// Named storage backends with a default
#[derive(Clone)]
pub struct StorageSet {
    default_name: String,
    backends: HashMap<String, Arc<dyn Storage>>,
}

impl StorageSet {
    /// Create a set with a single default backend
    pub fn new(default_name: impl Into<String>, default_backend: Arc<dyn Storage>) -> Self {
        let default_name = default_name.into();
        let mut backends = HashMap::new();
        backends.insert(default_name.clone(), default_backend);
        Self {
            default_name,
            backends,
        }
    }

    /// An in-memory default backend, for tests
    pub fn in_memory() -> Self {
        Self::new("default", Arc::new(MemoryStorage::new()))
    }

    /// Add another named backend
    pub fn with_backend(mut self, name: impl Into<String>, backend: Arc<dyn Storage>) -> Self {
        self.backends.insert(name.into(), backend);
        self
    }

    /// Build every configured backend
    pub async fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let mut backends: HashMap<String, Arc<dyn Storage>> = HashMap::new();
        for (name, backend) in &config.backends {
            let storage: Arc<dyn Storage> = match backend {
                StorageBackendConfig::Filesystem { root } => {
                    Arc::new(FilesystemStorage::new_with_init(root).await?)
                }
                StorageBackendConfig::Memory => Arc::new(MemoryStorage::new()),
            };
            info!(backend = %name, kind = ?backend, "Storage backend initialized");
            backends.insert(name.clone(), storage);
        }
        if !backends.contains_key(&config.default_backend) {
            return Err(StorageError::UnknownBackend(config.default_backend.clone()));
        }
        Ok(Self {
            default_name: config.default_backend.clone(),
            backends,
        })
    }

    /// Name of the default backend
    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// The default backend
    pub fn default_backend(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.backends[&self.default_name])
    }

    /// Look up a backend by name
    pub fn backend(&self, name: &str) -> Result<Arc<dyn Storage>, StorageError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownBackend(name.to_string()))
    }

    /// Backend a repository reads and writes
    pub fn for_repository(&self, repo: &Repository) -> Result<Arc<dyn Storage>, StorageError> {
        match &repo.config.storage_backend {
            Some(name) => self.backend(name),
            None => Ok(self.default_backend()),
        }
    }

    /// Move every key under `prefix` from one backend to another
    ///
    /// Each key is copied before its source is deleted, so an interrupted
    /// migration leaves keys readable from at least one side. Returns the
    /// number of keys moved.
    pub async fn migrate(&self, prefix: &str, from: &str, to: &str) -> Result<usize, StorageError> {
        if from == to {
            return Ok(0);
        }
        let source = self.backend(from)?;
        let target = self.backend(to)?;

        let keys = source.list(prefix).await?;
        let mut moved = 0;
        for key in keys {
            if let Some(data) = source.get(&key).await? {
                target.put(&key, data).await?;
                source.delete(&key).await?;
                moved += 1;
            }
        }

        info!(prefix = prefix, from = from, to = to, moved = moved, "Storage migration complete");
        Ok(moved)
    }
}
