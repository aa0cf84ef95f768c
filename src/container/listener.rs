//! Lifecycle of per-repository registry listeners
//!
//! Each running container repository owns one listener. Start and stop for
//! one repository are serialized through that repository's slot; different
//! repositories never wait on each other. Port claims are tracked separately
//! so a pinned port is refused before anything is bound.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ContainerConfig;
use crate::error::PluginError;
use crate::models::Repository;
use crate::router::RepositoryRouter;

use super::app::{listener_app, ListenerState};
use super::auth::ListenerAccess;
use super::uploads::UploadSessions;

/// How long a stopping listener may drain in-flight requests
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// A bound listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryListener {
    pub repository_id: String,
    pub port: u16,
    pub bound_at: DateTime<Utc>,
}

struct ListenerHandle {
    port: u16,
    bound_at: DateTime<Utc>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

type Slot = Arc<tokio::sync::Mutex<Option<ListenerHandle>>>;

/// Starts, stops and tracks registry listeners
pub struct ListenerManager {
    config: ContainerConfig,
    router: Weak<RepositoryRouter>,
    access: Arc<ListenerAccess>,
    sessions: Arc<UploadSessions>,
    slots: Mutex<HashMap<String, Slot>>,
    ports: Mutex<HashMap<u16, String>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ListenerManager {
    pub fn new(config: ContainerConfig, router: Weak<RepositoryRouter>, access: ListenerAccess) -> Self {
        let sessions = Arc::new(
            UploadSessions::new(&config.upload_dir).with_max_blob_bytes(config.max_blob_bytes),
        );
        Self {
            config,
            router,
            access: Arc::new(access),
            sessions,
            slots: Mutex::new(HashMap::new()),
            ports: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<UploadSessions> {
        &self.sessions
    }

    fn slot(&self, repository_id: &str) -> Slot {
        guard(&self.slots)
            .entry(repository_id.to_string())
            .or_default()
            .clone()
    }

    /// Start the listener of `repo`, returning the bound port
    ///
    /// Idempotent while running. `registry.port` of `Some(0)` binds an
    /// ephemeral port; `None` takes the first free port of the range.
    pub async fn start(&self, repo: &Repository) -> Result<u16, PluginError> {
        let slot = self.slot(&repo.id);
        let mut current = slot.lock().await;
        self.start_locked(repo, &mut current).await
    }

    /// Stop the listener of a repository and discard its upload sessions
    ///
    /// A no-op when none is running.
    pub async fn stop(&self, repository_id: &str) -> Result<(), PluginError> {
        let slot = self.slot(repository_id);
        let mut current = slot.lock().await;
        self.stop_locked(repository_id, &mut current).await;
        self.sessions.drop_repository(repository_id).await;
        Ok(())
    }

    /// Stop then start without letting another start or stop interleave
    pub async fn restart(&self, repo: &Repository) -> Result<u16, PluginError> {
        let slot = self.slot(&repo.id);
        let mut current = slot.lock().await;
        self.stop_locked(&repo.id, &mut current).await;
        self.start_locked(repo, &mut current).await
    }

    async fn start_locked(
        &self,
        repo: &Repository,
        current: &mut Option<ListenerHandle>,
    ) -> Result<u16, PluginError> {
        if let Some(handle) = current.as_ref() {
            if !handle.task.is_finished() {
                return Ok(handle.port);
            }
        }
        if let Some(stale) = current.take() {
            self.release(&repo.id, stale.port);
        }

        let settings = repo.config.registry.clone().unwrap_or_default();
        let listener = match settings.port {
            Some(port) => self.bind_pinned(&repo.id, port).await?,
            None => self.bind_from_range(&repo.id).await?,
        };
        let port = listener
            .local_addr()
            .map_err(|e| PluginError::Listener(e.to_string()))?
            .port();
        guard(&self.ports).insert(port, repo.id.clone());

        let app = listener_app(ListenerState {
            repository_id: repo.id.clone(),
            router: self.router.clone(),
            sessions: Arc::clone(&self.sessions),
            access: Arc::clone(&self.access),
            protocol_version: settings.protocol_version.clone(),
        });
        let (shutdown, signal) = oneshot::channel::<()>();
        let name = repo.name.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await;
            if let Err(e) = served {
                warn!(repository = %name, port, error = %e, "Registry listener stopped with error");
            }
        });

        info!(repository = %repo.name, port, "Registry listener started");
        *current = Some(ListenerHandle {
            port,
            bound_at: Utc::now(),
            shutdown,
            task,
        });
        Ok(port)
    }

    async fn stop_locked(&self, repository_id: &str, current: &mut Option<ListenerHandle>) {
        let Some(handle) = current.take() else {
            return;
        };
        let _ = handle.shutdown.send(());
        let mut task = handle.task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!(repository_id, port = handle.port, "Registry listener did not drain in time; aborting");
            task.abort();
        }
        self.release(repository_id, handle.port);
        info!(repository_id, port = handle.port, "Registry listener stopped");
    }

    fn release(&self, repository_id: &str, port: u16) {
        let mut ports = guard(&self.ports);
        if ports.get(&port).map(String::as_str) == Some(repository_id) {
            ports.remove(&port);
        }
    }

    fn claimed_by_other(&self, repository_id: &str, port: u16) -> bool {
        guard(&self.ports)
            .get(&port)
            .is_some_and(|owner| owner != repository_id)
    }

    async fn bind(&self, port: u16) -> std::io::Result<TcpListener> {
        TcpListener::bind((self.config.host.as_str(), port)).await
    }

    async fn bind_pinned(&self, repository_id: &str, port: u16) -> Result<TcpListener, PluginError> {
        if port != 0 && self.claimed_by_other(repository_id, port) {
            return Err(PluginError::PortClaimed(port));
        }
        self.bind(port).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                PluginError::PortClaimed(port)
            } else {
                PluginError::Listener(format!("cannot bind port {}: {}", port, e))
            }
        })
    }

    async fn bind_from_range(&self, repository_id: &str) -> Result<TcpListener, PluginError> {
        for port in self.config.port_range_start..=self.config.port_range_end {
            if guard(&self.ports).contains_key(&port) {
                continue;
            }
            match self.bind(port).await {
                Ok(listener) => return Ok(listener),
                Err(_) => continue,
            }
        }
        Err(PluginError::Listener(format!(
            "no free port in {}-{} for repository {}",
            self.config.port_range_start, self.config.port_range_end, repository_id
        )))
    }

    /// Pick a free port from the range, skipping `taken`
    ///
    /// The port is tested, not held; the caller persists it and the listener
    /// binds it on start.
    pub async fn allocate(&self, taken: &HashSet<u16>) -> Result<u16, PluginError> {
        for port in self.config.port_range_start..=self.config.port_range_end {
            if taken.contains(&port) || guard(&self.ports).contains_key(&port) {
                continue;
            }
            if self.bind(port).await.is_ok() {
                return Ok(port);
            }
        }
        Err(PluginError::Listener(format!(
            "no free port in {}-{}",
            self.config.port_range_start, self.config.port_range_end
        )))
    }

    /// Listeners currently running
    pub async fn running(&self) -> Vec<RegistryListener> {
        let slots: Vec<(String, Slot)> = guard(&self.slots)
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        let mut running = Vec::new();
        for (repository_id, slot) in slots {
            if let Some(handle) = slot.lock().await.as_ref() {
                running.push(RegistryListener {
                    repository_id,
                    port: handle.port,
                    bound_at: handle.bound_at,
                });
            }
        }
        running.sort_by_key(|l| l.port);
        running
    }

    /// Port a repository's listener is bound to
    pub fn port_of(&self, repository_id: &str) -> Option<u16> {
        guard(&self.ports)
            .iter()
            .find(|(_, owner)| owner.as_str() == repository_id)
            .map(|(port, _)| *port)
    }

    /// Stop every listener
    pub async fn stop_all(&self) {
        let ids: Vec<String> = guard(&self.slots).keys().cloned().collect();
        for id in ids {
            let _ = self.stop(&id).await;
        }
    }
}

impl std::fmt::Debug for ListenerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerManager")
            .field("host", &self.config.host)
            .field("ports", &*guard(&self.ports))
            .finish()
    }
}
