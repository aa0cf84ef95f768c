//! Blob upload sessions of the registry protocol
//!
//! A session spools chunks to a temp file while hashing them, so finalizing
//! never has to re-read the bytes to verify the client's digest. Chunks of
//! one session are applied under that session's lock in arrival order;
//! different sessions never contend. Sessions that stop receiving chunks
//! are reaped after an idle timeout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::digest::{ContentDigest, DigestHasher};

/// Upload session failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UploadError {
    /// No session with this id for this repository and image
    #[error("Unknown upload session: {0}")]
    UnknownSession(String),

    /// Chunk does not continue where the session left off
    #[error("Chunk starts at {got}, expected {expected}")]
    RangeInvalid { expected: u64, got: u64 },

    /// Received bytes do not hash to the asserted digest
    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Blob would exceed the configured ceiling
    #[error("Blob exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    /// Spool file failure
    #[error("Upload IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Io(e.to_string())
    }
}

/// Public view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    pub id: String,
    pub repository_id: String,
    pub name: String,
    pub bytes_received: u64,
    pub started_at: DateTime<Utc>,
}

struct UploadSession {
    status: UploadStatus,
    path: PathBuf,
    file: Option<File>,
    hasher: DigestHasher,
    limit: u64,
}

impl UploadSession {
    async fn append(&mut self, data: &[u8]) -> Result<u64, UploadError> {
        if self.status.bytes_received.saturating_add(data.len() as u64) > self.limit {
            return Err(UploadError::TooLarge { limit: self.limit });
        }
        if !data.is_empty() {
            let file = self
                .file
                .as_mut()
                .ok_or_else(|| UploadError::Io("session already closed".to_string()))?;
            file.write_all(data).await?;
            self.hasher.update(data);
            self.status.bytes_received += data.len() as u64;
        }
        Ok(self.status.bytes_received)
    }

    /// Write the last chunk, close the spool file and check the digest
    ///
    /// The verified blob is read back whole; the session limit bounds it.
    async fn seal(&mut self, last_chunk: &[u8], expected: ContentDigest) -> Result<Bytes, UploadError> {
        self.append(last_chunk).await?;
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        let actual = std::mem::take(&mut self.hasher).finalize();
        if actual != expected {
            return Err(UploadError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(Bytes::from(fs::read(&self.path).await?))
    }
}

struct Slot {
    repository_id: String,
    name: String,
    /// Unix millis of the last chunk
    touched: AtomicI64,
    session: tokio::sync::Mutex<UploadSession>,
}

impl Slot {
    fn touch(&self) {
        self.touched.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let millis = now.timestamp_millis() - self.touched.load(Ordering::Relaxed);
        Duration::from_millis(millis.max(0) as u64)
    }
}

/// In-progress uploads of every listener
pub struct UploadSessions {
    dir: PathBuf,
    max_blob_bytes: u64,
    sessions: Mutex<HashMap<String, Arc<Slot>>>,
}

impl UploadSessions {
    /// Sessions spooled under `dir`, created on first use
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_blob_bytes: u64::MAX,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Refuse blobs larger than `limit` bytes
    pub fn with_max_blob_bytes(mut self, limit: u64) -> Self {
        self.max_blob_bytes = limit;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_blob_bytes(&self) -> u64 {
        self.max_blob_bytes
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, repository_id: &str, name: &str, id: &str) -> Result<Arc<Slot>, UploadError> {
        self.lock()
            .get(id)
            .filter(|slot| slot.repository_id == repository_id && slot.name == name)
            .cloned()
            .ok_or_else(|| UploadError::UnknownSession(id.to_string()))
    }

    /// Open a session for `name` in a repository
    pub async fn initiate(&self, repository_id: &str, name: &str) -> Result<UploadStatus, UploadError> {
        fs::create_dir_all(&self.dir).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let path = self.dir.join(&id);
        let file = File::create(&path).await?;

        let status = UploadStatus {
            id: id.clone(),
            repository_id: repository_id.to_string(),
            name: name.to_string(),
            bytes_received: 0,
            started_at: Utc::now(),
        };
        let session = UploadSession {
            status: status.clone(),
            path,
            file: Some(file),
            hasher: ContentDigest::hasher(),
            limit: self.max_blob_bytes,
        };
        let slot = Slot {
            repository_id: repository_id.to_string(),
            name: name.to_string(),
            touched: AtomicI64::new(Utc::now().timestamp_millis()),
            session: tokio::sync::Mutex::new(session),
        };
        self.lock().insert(id.clone(), Arc::new(slot));
        debug!(upload = %id, repository_id, image = name, "Upload session started");
        Ok(status)
    }

    /// Append a chunk; `start` is the first offset of a `Content-Range`, when sent
    pub async fn append(
        &self,
        repository_id: &str,
        name: &str,
        id: &str,
        start: Option<u64>,
        data: Bytes,
    ) -> Result<UploadStatus, UploadError> {
        let slot = self.slot(repository_id, name, id)?;
        let mut session = slot.session.lock().await;
        slot.touch();
        if let Some(start) = start {
            if start != session.status.bytes_received {
                return Err(UploadError::RangeInvalid {
                    expected: session.status.bytes_received,
                    got: start,
                });
            }
        }
        session.append(&data).await?;
        Ok(session.status.clone())
    }

    /// Progress of a session
    pub async fn status(&self, repository_id: &str, name: &str, id: &str) -> Result<UploadStatus, UploadError> {
        let slot = self.slot(repository_id, name, id)?;
        let session = slot.session.lock().await;
        Ok(session.status.clone())
    }

    /// Abandon a session and its spooled bytes
    pub async fn cancel(&self, repository_id: &str, name: &str, id: &str) -> Result<(), UploadError> {
        let slot = self.slot(repository_id, name, id)?;
        self.lock().remove(id);
        close(&slot).await;
        debug!(upload = %id, "Upload session cancelled");
        Ok(())
    }

    /// Discard sessions that received nothing for `max_idle`
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let now = Utc::now();
        let stale = self.remove_where(|slot| slot.idle_for(now) >= max_idle);
        for slot in &stale {
            close(slot).await;
        }
        if !stale.is_empty() {
            info!(reaped = stale.len(), "Idle upload sessions discarded");
        }
        stale.len()
    }

    /// Discard every session of a repository
    pub async fn drop_repository(&self, repository_id: &str) -> usize {
        let dropped = self.remove_where(|slot| slot.repository_id == repository_id);
        for slot in &dropped {
            close(slot).await;
        }
        if !dropped.is_empty() {
            debug!(repository_id, dropped = dropped.len(), "Upload sessions dropped");
        }
        dropped.len()
    }

    fn remove_where(&self, matches: impl Fn(&Slot) -> bool) -> Vec<Arc<Slot>> {
        let mut sessions = self.lock();
        let ids: Vec<String> = sessions
            .iter()
            .filter(|(_, slot)| matches(slot))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| sessions.remove(id)).collect()
    }

    /// Close a session, returning its bytes when they hash to `expected`
    ///
    /// The session is consumed either way; on a mismatch the spooled bytes
    /// are discarded and nothing is returned to commit.
    pub async fn finalize(
        &self,
        repository_id: &str,
        name: &str,
        id: &str,
        expected: ContentDigest,
        last_chunk: Bytes,
    ) -> Result<Bytes, UploadError> {
        let slot = self.slot(repository_id, name, id)?;
        self.lock().remove(id);
        let mut session = slot.session.lock().await;

        let outcome = session.seal(&last_chunk, expected).await;

        discard(&session.path).await;
        match &outcome {
            Ok(body) => debug!(upload = %id, size = body.len(), digest = %expected, "Upload session finalized"),
            Err(e) => warn!(upload = %id, error = %e, "Upload session rejected"),
        }
        outcome
    }

    /// Number of open sessions
    pub fn open(&self) -> usize {
        self.lock().len()
    }
}

/// Close the spool file of a removed session and delete it
///
/// Waits for an in-flight chunk; later chunks find the file closed.
async fn close(slot: &Slot) {
    let mut session = slot.session.lock().await;
    session.file = None;
    discard(&session.path).await;
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove upload spool file");
        }
    }
}

/// Run [`UploadSessions::reap_idle`] until shutdown is signalled
pub fn spawn_upload_reaper(
    sessions: Arc<UploadSessions>,
    max_idle: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let every = max_idle.clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    sessions.reap_idle(max_idle).await;
                }
            }
        }
    })
}

impl std::fmt::Debug for UploadSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSessions")
            .field("dir", &self.dir)
            .field("open", &self.open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sessions() -> (TempDir, UploadSessions) {
        let dir = TempDir::new().unwrap();
        let sessions = UploadSessions::new(dir.path().join("uploads"));
        (dir, sessions)
    }

    // Test 1: chunks accumulate and finalize verifies the digest
    #[tokio::test]
    async fn test_chunked_upload() {
        let (_dir, sessions) = sessions();
        let status = sessions.initiate("repo", "app").await.unwrap();

        sessions
            .append("repo", "app", &status.id, Some(0), Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let progress = sessions
            .append("repo", "app", &status.id, Some(6), Bytes::from_static(b"world"))
            .await
            .unwrap();
        assert_eq!(progress.bytes_received, 11);

        let digest = ContentDigest::compute(b"hello world");
        let body = sessions
            .finalize("repo", "app", &status.id, digest, Bytes::new())
            .await
            .unwrap();
        assert_eq!(body, Bytes::from_static(b"hello world"));
        assert_eq!(sessions.open(), 0);
    }

    // Test 2: out-of-order chunks are rejected
    #[tokio::test]
    async fn test_range_must_continue() {
        let (_dir, sessions) = sessions();
        let status = sessions.initiate("repo", "app").await.unwrap();
        sessions
            .append("repo", "app", &status.id, None, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let err = sessions
            .append("repo", "app", &status.id, Some(10), Bytes::from_static(b"def"))
            .await
            .unwrap_err();
        assert_eq!(err, UploadError::RangeInvalid { expected: 3, got: 10 });
    }

    // Test 3: a wrong digest consumes the session and returns nothing
    #[tokio::test]
    async fn test_digest_mismatch_discards() {
        let (_dir, sessions) = sessions();
        let status = sessions.initiate("repo", "app").await.unwrap();
        let wrong = ContentDigest::compute(b"something else");

        let err = sessions
            .finalize("repo", "app", &status.id, wrong, Bytes::from_static(b"payload"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::DigestMismatch { .. }));
        assert_eq!(sessions.open(), 0);
        assert!(!sessions.dir().join(&status.id).exists());

        let again = sessions
            .status("repo", "app", &status.id)
            .await
            .unwrap_err();
        assert_eq!(again, UploadError::UnknownSession(status.id.clone()));
    }

    // Test 4: sessions are scoped to their repository and image
    #[tokio::test]
    async fn test_session_scope() {
        let (_dir, sessions) = sessions();
        let status = sessions.initiate("repo", "app").await.unwrap();

        assert!(sessions.status("other", "app", &status.id).await.is_err());
        assert!(sessions.status("repo", "other", &status.id).await.is_err());

        sessions.cancel("repo", "app", &status.id).await.unwrap();
        assert_eq!(sessions.open(), 0);
    }

    // Test 5: idle sessions are reaped with their spool files
    #[tokio::test]
    async fn test_reap_idle() {
        let (_dir, sessions) = sessions();
        let status = sessions.initiate("repo", "app").await.unwrap();
        sessions
            .append("repo", "app", &status.id, None, Bytes::from_static(b"partial"))
            .await
            .unwrap();
        let spool = sessions.dir().join(&status.id);
        assert!(spool.exists());

        assert_eq!(sessions.reap_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(sessions.open(), 1);

        assert_eq!(sessions.reap_idle(Duration::ZERO).await, 1);
        assert_eq!(sessions.open(), 0);
        assert!(!spool.exists());

        let late = sessions
            .append("repo", "app", &status.id, None, Bytes::from_static(b"more"))
            .await
            .unwrap_err();
        assert_eq!(late, UploadError::UnknownSession(status.id.clone()));
    }

    // Test 6: stopping a repository drops only its sessions
    #[tokio::test]
    async fn test_drop_repository() {
        let (_dir, sessions) = sessions();
        let gone = sessions.initiate("repo", "app").await.unwrap();
        let kept = sessions.initiate("other", "app").await.unwrap();

        assert_eq!(sessions.drop_repository("repo").await, 1);
        assert!(!sessions.dir().join(&gone.id).exists());
        assert!(sessions.status("other", "app", &kept.id).await.is_ok());
    }

    // Test 7: chunks past the blob ceiling are refused
    #[tokio::test]
    async fn test_blob_ceiling() {
        let dir = TempDir::new().unwrap();
        let sessions = UploadSessions::new(dir.path().join("uploads")).with_max_blob_bytes(8);
        let status = sessions.initiate("repo", "app").await.unwrap();
        sessions
            .append("repo", "app", &status.id, Some(0), Bytes::from_static(b"12345"))
            .await
            .unwrap();

        let err = sessions
            .append("repo", "app", &status.id, Some(5), Bytes::from_static(b"6789"))
            .await
            .unwrap_err();
        assert_eq!(err, UploadError::TooLarge { limit: 8 });

        let err = sessions
            .finalize("repo", "app", &status.id, ContentDigest::compute(b"123456789"), Bytes::from_static(b"6789"))
            .await
            .unwrap_err();
        assert_eq!(err, UploadError::TooLarge { limit: 8 });
    }

    // Test 8: the reaper task stops on shutdown
    #[tokio::test]
    async fn test_reaper_stops() {
        let (_dir, sessions) = sessions();
        let (tx, rx) = broadcast::channel(1);
        let handle = spawn_upload_reaper(Arc::new(sessions), Duration::from_secs(1), rx);
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper should stop")
            .unwrap();
    }
}
