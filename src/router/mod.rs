//! Repository router
//!
//! Resolves a repository by id or name, picks the ecosystem plugin by its
//! manager and dispatches by repository type:
//! - hosted repositories read and write storage directly
//! - proxy repositories read through the proxy cache and refuse writes
//! - group repositories delegate to the [`GroupRouter`]
//!
//! Repository lifecycle goes through here too, so listener ports are claimed,
//! persisted and released in one place.

pub mod group;

pub use group::GroupRouter;

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::AuthManager;
use crate::config::ContainerConfig;
use crate::container::{ListenerAccess, ListenerManager};
use crate::database::Database;
use crate::error::{PluginError, RegistryError};
use crate::models::{
    Artifact, CreateRepositoryRequest, PackageDetails, Repository, RepositoryConfig,
    RepositoryType,
};
use crate::plugins::cache::{CacheStats, ProxyCache};
use crate::plugins::registry::docker::DockerPlugin;
use crate::plugins::registry::{
    hosted, version, NativeMethod, PluginContext, PluginRegistry, RegistryPlugin,
    RegistryResponse, UploadRequest,
};
use crate::storage::{cache_prefix, repository_prefix, StorageSet};

/// What a repository mutation did to its listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ListenerOutcome {
    /// The repository has no listener
    NotApplicable,
    Started { port: u16 },
    Restarted { port: u16 },
    /// Running and untouched by the change
    Unchanged,
    Stopped,
    /// The change was persisted but the listener could not follow
    Failed { error: String },
}

/// Result of creating, updating or deleting a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryChange {
    pub repository: Repository,
    pub listener: ListenerOutcome,
}

fn invalid(e: impl std::fmt::Display) -> RegistryError {
    RegistryError::InvalidRequest(e.to_string())
}

fn registry_port(repo: &Repository) -> Option<u16> {
    repo.config.registry.as_ref().and_then(|r| r.port)
}

/// Dispatches repository operations to plugins
pub struct RepositoryRouter {
    db: Arc<dyn Database>,
    storage: StorageSet,
    cache: Arc<ProxyCache>,
    plugins: PluginRegistry,
    public_url: String,
    port_lock: Mutex<()>,
    listeners: Option<Arc<ListenerManager>>,
    auth: Option<Arc<AuthManager>>,
}

impl RepositoryRouter {
    /// Router without container listeners
    pub fn new(
        db: Arc<dyn Database>,
        storage: StorageSet,
        cache: Arc<ProxyCache>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            storage,
            cache,
            plugins: PluginRegistry::with_defaults(None),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            port_lock: Mutex::new(()),
            listeners: None,
            auth: None,
        }
    }

    /// Replace the plugin registry
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    /// Credential checks for ecosystem-native login flows
    pub fn with_auth(mut self, auth: Arc<AuthManager>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Share the router and give container repositories their listeners
    ///
    /// Listeners hold a weak reference back to the router, so dropping the
    /// last strong reference makes them answer 503 until stopped.
    pub fn with_listeners(self, config: ContainerConfig, access: ListenerAccess) -> Arc<Self> {
        Arc::new_cyclic(|router| {
            let listeners = Arc::new(ListenerManager::new(config, router.clone(), access));
            let plugins = self
                .plugins
                .register(Arc::new(DockerPlugin::with_listeners(Arc::clone(&listeners))));
            Self {
                plugins,
                listeners: Some(listeners),
                ..self
            }
        })
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn cache(&self) -> &Arc<ProxyCache> {
        &self.cache
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn listeners(&self) -> Option<&Arc<ListenerManager>> {
        self.listeners.as_ref()
    }

    /// Absolute URL of a repository's ecosystem-native endpoints
    pub fn repository_url(&self, name: &str) -> String {
        format!("{}/repository/{}", self.public_url, name)
    }

    fn manages_listener(&self, repo: &Repository) -> bool {
        self.listeners.is_some() && repo.runs_listener()
    }

    fn plugin(&self, repo: &Repository) -> Result<Arc<dyn RegistryPlugin>, RegistryError> {
        Ok(self.plugins.get(repo.manager)?)
    }

    fn context(&self, repo: &Repository) -> Result<PluginContext, RegistryError> {
        let storage = self.storage.for_repository(repo)?;
        Ok(PluginContext::new(
            repo.clone(),
            storage,
            Arc::clone(&self.db),
            Arc::clone(&self.cache),
            self.repository_url(&repo.name),
        ))
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Repository by id or name; `None` when neither resolves
    pub async fn get_repository(&self, repo_ref: &str) -> Result<Option<Repository>, RegistryError> {
        if let Some(repo) = self.db.get_repository(repo_ref).await? {
            return Ok(Some(repo));
        }
        Ok(self.db.get_repository_by_name(repo_ref).await?)
    }

    async fn resolve(&self, repo_ref: &str) -> Result<Repository, RegistryError> {
        self.get_repository(repo_ref)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("repository '{}'", repo_ref)))
    }

    pub async fn list_repositories(&self) -> Result<Vec<Repository>, RegistryError> {
        Ok(self.db.list_repositories().await?)
    }

    /// Members of a group, in order
    pub async fn group(&self, repo: &Repository) -> Result<GroupRouter, RegistryError> {
        GroupRouter::load(self.db.as_ref(), repo.clone()).await
    }

    /// Repository that actually stores writes sent to `repo`
    pub async fn write_target(&self, repo: &Repository) -> Result<Repository, RegistryError> {
        match repo.repo_type {
            RepositoryType::Hosted => Ok(repo.clone()),
            RepositoryType::Proxy => Err(RegistryError::WriteRejected(format!(
                "proxy repository '{}' is read-only",
                repo.name
            ))),
            RepositoryType::Group => Ok(self.group(repo).await?.write_target()?.clone()),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Serve a path; `Ok(None)` when the repository or the resource is absent
    pub async fn download(&self, repo_ref: &str, path: &str) -> Result<Option<RegistryResponse>, RegistryError> {
        let Some(repo) = self.get_repository(repo_ref).await? else {
            return Ok(None);
        };
        let base_url = self.repository_url(&repo.name);
        match repo.repo_type {
            RepositoryType::Group => {
                let group = self.group(&repo).await?;
                let base_url = base_url.as_str();
                group
                    .first_hit(|member| async move { self.read_member(&member, path, base_url).await })
                    .await
            }
            _ => self.read_member(&repo, path, &base_url).await,
        }
    }

    async fn read_member(
        &self,
        repo: &Repository,
        path: &str,
        base_url: &str,
    ) -> Result<Option<RegistryResponse>, RegistryError> {
        let plugin = self.plugin(repo)?;
        let ctx = self.context(repo)?.with_base_url(base_url);
        let result = match repo.repo_type {
            RepositoryType::Hosted => plugin.download(&ctx, path).await,
            RepositoryType::Proxy => plugin.proxy_fetch(&ctx, path).await,
            RepositoryType::Group => {
                return Err(invalid(format!("group '{}' cannot be a member", repo.name)))
            }
        };
        match result {
            Ok(found) => Ok(found),
            Err(PluginError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch through the proxy cache of a proxy repository
    pub async fn proxy_fetch(&self, repo_ref: &str, path: &str) -> Result<Option<RegistryResponse>, RegistryError> {
        let repo = self.resolve(repo_ref).await?;
        if repo.repo_type != RepositoryType::Proxy {
            return Err(invalid(format!("'{}' is not a proxy repository", repo.name)));
        }
        let ctx = self.context(&repo)?;
        Ok(self.plugin(&repo)?.proxy_fetch(&ctx, path).await?)
    }

    /// Versions of a package, ascending; a group reports the union of its members
    pub async fn list_versions(&self, repo_ref: &str, name: &str) -> Result<Vec<String>, RegistryError> {
        let repo = self.resolve(repo_ref).await?;
        if repo.repo_type != RepositoryType::Group {
            let ctx = self.context(&repo)?;
            return Ok(self.plugin(&repo)?.list_versions(&ctx, name).await?);
        }

        let group = self.group(&repo).await?;
        let mut lists = Vec::with_capacity(group.members().len());
        for member in group.members() {
            let ctx = self.context(member)?;
            match self.plugin(member)?.list_versions(&ctx, name).await {
                Ok(versions) => lists.push(versions),
                Err(e) => {
                    debug!(group = %repo.name, member = %member.name, error = %e, "Member versions unavailable")
                }
            }
        }
        Ok(GroupRouter::union_versions(&lists))
    }

    /// Package summary
    pub async fn get_package_details(&self, repo_ref: &str, name: &str) -> Result<PackageDetails, RegistryError> {
        let repo = self.resolve(repo_ref).await?;
        let plugin = self.plugin(&repo)?;
        if repo.repo_type != RepositoryType::Group {
            let ctx = self.context(&repo)?;
            return Ok(plugin.get_package_details(&ctx, name).await?);
        }

        let versions = self.list_versions(&repo.id, name).await?;
        if versions.is_empty() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        let latest = version::latest(versions.iter().map(String::as_str));
        Ok(PackageDetails::from_versions(&plugin.canonical_name(name), versions, latest))
    }

    pub async fn cache_stats(&self, repo_ref: &str) -> Result<CacheStats, RegistryError> {
        let repo = self.resolve(repo_ref).await?;
        Ok(self.cache.stats(&repo.id).await)
    }

    /// Drop a repository's cached upstream resources, returning the count
    pub async fn clear_cache(&self, repo_ref: &str) -> Result<usize, RegistryError> {
        let repo = self.resolve(repo_ref).await?;
        Ok(self.cache.clear(&repo).await?)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store one file through the repository's write target
    pub async fn upload(&self, repo_ref: &str, req: UploadRequest) -> Result<Artifact, RegistryError> {
        let repo = self.resolve(repo_ref).await?;
        let target = self.write_target(&repo).await?;
        let ctx = self.context(&target)?;
        let artifact = self.plugin(&target)?.upload(&ctx, req).await?;
        info!(repository = %target.name, package = %artifact.name, version = %artifact.version, "Artifact stored");
        Ok(artifact)
    }

    /// Remove every file of a version
    pub async fn delete_package_version(
        &self,
        repo_ref: &str,
        name: &str,
        version: &str,
    ) -> Result<Vec<Artifact>, RegistryError> {
        let repo = self.resolve(repo_ref).await?;
        let target = self.write_target(&repo).await?;
        let ctx = self.context(&target)?;
        let removed = self
            .plugin(&target)?
            .delete_package_version(&ctx, name, version)
            .await?;
        info!(repository = %target.name, package = name, version, files = removed.len(), "Version deleted");
        Ok(removed)
    }

    /// Handle an ecosystem-native write: login, native action, delete or publish
    pub async fn upload_raw(
        &self,
        repo_ref: &str,
        method: NativeMethod,
        path: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<RegistryResponse, RegistryError> {
        let repo = self.resolve(repo_ref).await?;
        let plugin = self.plugin(&repo)?;

        if let Some(login) = plugin.parse_login(path, &body) {
            let auth = self
                .auth
                .as_ref()
                .ok_or_else(|| RegistryError::Unsupported("authentication is not configured".to_string()))?;
            let login = plugin.authenticate(auth, login).await?;
            info!(repository = %repo.name, principal = %login.principal.name, "Native login");
            return Ok(plugin.login_response(&login));
        }

        let target = self.write_target(&repo).await?;
        let ctx = self
            .context(&target)?
            .with_base_url(self.repository_url(&repo.name));

        if let Some(response) = plugin.native_action(&ctx, method, path, &body).await? {
            return Ok(response);
        }

        match method {
            NativeMethod::Delete => {
                let (name, version) = plugin
                    .parse_delete(path)
                    .ok_or_else(|| invalid(format!("cannot delete {}", path)))?;
                let removed = plugin.delete_package_version(&ctx, &name, &version).await?;
                info!(repository = %target.name, package = %name, version = %version, files = removed.len(), "Version deleted");
                Ok(RegistryResponse::json(200, &json!({ "deleted": removed.len() })))
            }
            NativeMethod::Get => Err(invalid(format!("GET {} is not a write", path))),
            NativeMethod::Put | NativeMethod::Post => {
                let provenance = hosted::provenance_from_headers(headers);
                let mut stored = Vec::new();
                for mut req in plugin.parse_upload(path, headers, body)? {
                    if req.provenance.is_none() {
                        req.provenance = provenance.clone();
                    }
                    stored.push(plugin.upload(&ctx, req).await?);
                }
                for artifact in &stored {
                    info!(repository = %target.name, package = %artifact.name, version = %artifact.version, file = %artifact.path, "Artifact stored");
                }
                Ok(plugin.upload_response(&stored))
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Replace member references (ids or names) by ids and check group rules
    async fn normalize_members(&self, repo: &mut Repository) -> Result<(), RegistryError> {
        if repo.repo_type != RepositoryType::Group {
            if !repo.config.members.is_empty() {
                return Err(invalid("only group repositories have members"));
            }
            return Ok(());
        }

        let mut ids = Vec::with_capacity(repo.config.members.len());
        for member_ref in &repo.config.members {
            let member = self
                .get_repository(member_ref)
                .await?
                .ok_or_else(|| invalid(format!("member '{}' does not exist", member_ref)))?;
            if member.manager != repo.manager {
                return Err(invalid(format!(
                    "member '{}' is a {} repository, group is {}",
                    member.name, member.manager, repo.manager
                )));
            }
            if member.repo_type == RepositoryType::Group {
                return Err(invalid(format!("member '{}' is itself a group", member.name)));
            }
            if let Some(writer) = repo.config.preferred_writer.as_mut() {
                if writer == member_ref {
                    *writer = member.id.clone();
                }
            }
            ids.push(member.id);
        }
        repo.config.members = ids;
        Ok(())
    }

    /// Validate or allocate the listener port of `repo` against every other repository
    async fn claim_port(&self, repo: &mut Repository) -> Result<(), RegistryError> {
        let Some(listeners) = &self.listeners else {
            return Ok(());
        };
        let taken: HashSet<u16> = self
            .db
            .list_repositories()
            .await?
            .iter()
            .filter(|r| r.id != repo.id && r.runs_listener())
            .filter_map(registry_port)
            .filter(|p| *p != 0)
            .collect();

        let settings = repo.config.registry.get_or_insert_with(Default::default);
        match settings.port {
            Some(0) => {}
            Some(port) if taken.contains(&port) => {
                return Err(RegistryError::Conflict(format!(
                    "port {} is already claimed by another repository",
                    port
                )));
            }
            Some(_) => {}
            None => settings.port = Some(listeners.allocate(&taken).await?),
        }
        Ok(())
    }

    /// Record the port a listener actually bound when it differs from the config
    async fn persist_port(&self, repo: &mut Repository, port: u16) {
        let settings = repo.config.registry.get_or_insert_with(Default::default);
        if settings.port == Some(port) {
            return;
        }
        settings.port = Some(port);
        if let Err(e) = self.db.update_repository(repo).await {
            warn!(repository = %repo.name, port, error = %e, "Failed to persist listener port");
        }
    }

    async fn start_listener(&self, repo: &mut Repository) -> ListenerOutcome {
        let started = match self.plugin(repo) {
            Ok(plugin) => plugin.start_registry_for_repo(repo).await.map_err(RegistryError::from),
            Err(e) => Err(e),
        };
        match started {
            Ok(port) => {
                self.persist_port(repo, port).await;
                ListenerOutcome::Started { port }
            }
            Err(e) => {
                warn!(repository = %repo.name, error = %e, "Registry listener failed to start");
                ListenerOutcome::Failed { error: e.to_string() }
            }
        }
    }

    async fn restart_listener(&self, repo: &mut Repository) -> ListenerOutcome {
        let Some(listeners) = &self.listeners else {
            return ListenerOutcome::NotApplicable;
        };
        match listeners.restart(repo).await {
            Ok(port) => {
                self.persist_port(repo, port).await;
                ListenerOutcome::Restarted { port }
            }
            Err(e) => {
                warn!(repository = %repo.name, error = %e, "Registry listener failed to restart");
                ListenerOutcome::Failed { error: e.to_string() }
            }
        }
    }

    async fn check_storage(&self, repo: &Repository) -> Result<(), RegistryError> {
        if let Some(name) = &repo.config.storage_backend {
            self.storage.backend(name).map_err(invalid)?;
        }
        Ok(())
    }

    /// Create a repository and, for container repositories, start its listener
    pub async fn create_repository(&self, request: CreateRepositoryRequest) -> Result<RepositoryChange, RegistryError> {
        let mut repo = Repository::new(request.name, request.repo_type, request.manager, request.config);
        let plugin = self.plugin(&repo)?;
        if !plugin.capabilities().contains(&repo.repo_type) {
            return Err(invalid(format!(
                "{} does not support {} repositories",
                repo.manager, repo.repo_type
            )));
        }
        self.normalize_members(&mut repo).await?;
        repo.validate().map_err(invalid)?;
        self.check_storage(&repo).await?;

        let _claim = self.port_lock.lock().await;
        if self.db.get_repository_by_name(&repo.name).await?.is_some() {
            return Err(RegistryError::Conflict(format!(
                "repository '{}' already exists",
                repo.name
            )));
        }
        if self.manages_listener(&repo) {
            self.claim_port(&mut repo).await?;
        }
        self.db.insert_repository(&repo).await?;
        info!(repository = %repo.name, id = %repo.id, kind = %repo.repo_type, manager = %repo.manager, "Repository created");

        let listener = if self.manages_listener(&repo) {
            self.start_listener(&mut repo).await
        } else {
            ListenerOutcome::NotApplicable
        };
        Ok(RepositoryChange {
            repository: repo,
            listener,
        })
    }

    /// Replace a repository's settings
    ///
    /// A container listener restarts only when its port, membership or
    /// write policy changed. Bytes move when the storage backend changes.
    pub async fn update_repository(
        &self,
        repo_ref: &str,
        config: RepositoryConfig,
    ) -> Result<RepositoryChange, RegistryError> {
        let current = self.resolve(repo_ref).await?;
        let mut updated = current.clone();
        updated.config = config;
        if updated.runs_listener() && registry_port(&updated).is_none() {
            if let Some(port) = registry_port(&current) {
                updated.config.registry.get_or_insert_with(Default::default).port = Some(port);
            }
        }
        self.normalize_members(&mut updated).await?;
        updated.validate().map_err(invalid)?;
        self.check_storage(&updated).await?;

        let _claim = self.port_lock.lock().await;
        if self.manages_listener(&updated) {
            self.claim_port(&mut updated).await?;
        }

        let from = current
            .config
            .storage_backend
            .clone()
            .unwrap_or_else(|| self.storage.default_name().to_string());
        let to = updated
            .config
            .storage_backend
            .clone()
            .unwrap_or_else(|| self.storage.default_name().to_string());
        if from != to {
            let moved = self
                .storage
                .migrate(&repository_prefix(&updated.id), &from, &to)
                .await?
                + self
                    .storage
                    .migrate(&cache_prefix(&updated.id), &from, &to)
                    .await?;
            info!(repository = %updated.name, from = %from, to = %to, keys = moved, "Repository storage migrated");
        }

        updated.updated_at = Utc::now();
        self.db.update_repository(&updated).await?;
        info!(repository = %updated.name, "Repository updated");

        let listener = match &self.listeners {
            Some(listeners) if updated.runs_listener() => {
                let changed = current.config.listener_fingerprint() != updated.config.listener_fingerprint();
                if changed || listeners.port_of(&updated.id).is_none() {
                    self.restart_listener(&mut updated).await
                } else {
                    ListenerOutcome::Unchanged
                }
            }
            _ => ListenerOutcome::NotApplicable,
        };
        Ok(RepositoryChange {
            repository: updated,
            listener,
        })
    }

    /// Delete a repository with its artifacts, bytes, cache entries, grants and listener
    pub async fn delete_repository(&self, repo_ref: &str) -> Result<RepositoryChange, RegistryError> {
        let repo = self.resolve(repo_ref).await?;

        let listener = if self.manages_listener(&repo) {
            match self.plugin(&repo)?.stop_registry_for_repo(&repo.id).await {
                Ok(()) => ListenerOutcome::Stopped,
                Err(e) => {
                    warn!(repository = %repo.name, error = %e, "Registry listener failed to stop");
                    ListenerOutcome::Failed { error: e.to_string() }
                }
            }
        } else {
            ListenerOutcome::NotApplicable
        };

        let storage = self.storage.for_repository(&repo)?;
        for key in storage.list(&repository_prefix(&repo.id)).await? {
            storage.delete(&key).await?;
        }
        if let Err(e) = self.cache.clear(&repo).await {
            warn!(repository = %repo.name, error = %e, "Failed to clear proxy cache");
        }
        self.db.delete_repository_permissions(&repo.id).await?;

        for mut group in self.db.list_repositories().await? {
            if group.repo_type != RepositoryType::Group || !group.config.members.contains(&repo.id) {
                continue;
            }
            group.config.members.retain(|m| m != &repo.id);
            if group.config.preferred_writer.as_deref() == Some(repo.id.as_str()) {
                group.config.preferred_writer = None;
            }
            group.updated_at = Utc::now();
            self.db.update_repository(&group).await?;
            info!(group = %group.name, member = %repo.name, "Removed deleted repository from group");
            if self.manages_listener(&group) {
                self.restart_listener(&mut group).await;
            }
        }

        self.db.delete_repository(&repo.id).await?;
        info!(repository = %repo.name, id = %repo.id, "Repository deleted");
        Ok(RepositoryChange {
            repository: repo,
            listener,
        })
    }

    /// Start the listener of every container repository, allocating missing ports
    pub async fn start_listeners(&self) -> Result<Vec<(String, ListenerOutcome)>, RegistryError> {
        let Some(listeners) = &self.listeners else {
            return Ok(Vec::new());
        };
        let _claim = self.port_lock.lock().await;
        let repos: Vec<Repository> = self
            .db
            .list_repositories()
            .await?
            .into_iter()
            .filter(Repository::runs_listener)
            .collect();
        let mut taken: HashSet<u16> = repos
            .iter()
            .filter_map(registry_port)
            .filter(|p| *p != 0)
            .collect();

        let mut outcomes = Vec::with_capacity(repos.len());
        for mut repo in repos {
            if registry_port(&repo).is_none() {
                match listeners.allocate(&taken).await {
                    Ok(port) => {
                        taken.insert(port);
                        self.persist_port(&mut repo, port).await;
                    }
                    Err(e) => {
                        warn!(repository = %repo.name, error = %e, "No port for registry listener");
                        outcomes.push((repo.name, ListenerOutcome::Failed { error: e.to_string() }));
                        continue;
                    }
                }
            }
            let outcome = self.start_listener(&mut repo).await;
            outcomes.push((repo.name, outcome));
        }
        Ok(outcomes)
    }

    /// Stop every listener
    pub async fn shutdown(&self) {
        if let Some(listeners) = &self.listeners {
            listeners.stop_all().await;
        }
    }
}

impl std::fmt::Debug for RepositoryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryRouter")
            .field("public_url", &self.public_url)
            .field("plugins", &self.plugins)
            .field("listeners", &self.listeners.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::database::SqliteDatabase;
    use crate::models::{Manager, RegistrySettings, WritePolicy};
    use crate::upstream::{RetryManager, UpstreamClient};

    async fn router() -> RepositoryRouter {
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let storage = StorageSet::in_memory();
        let upstream = Arc::new(UpstreamClient::with_client(
            reqwest::Client::new(),
            RetryManager::disabled(),
        ));
        let cache = Arc::new(ProxyCache::new(storage.clone(), upstream, CacheConfig::default()));
        RepositoryRouter::new(db, storage, cache, "http://depot.test")
    }

    fn request(name: &str, repo_type: RepositoryType, manager: Manager, config: RepositoryConfig) -> CreateRepositoryRequest {
        CreateRepositoryRequest {
            name: name.to_string(),
            repo_type,
            manager,
            config,
        }
    }

    async fn create(router: &RepositoryRouter, name: &str, repo_type: RepositoryType, config: RepositoryConfig) -> Repository {
        router
            .create_repository(request(name, repo_type, Manager::Raw, config))
            .await
            .unwrap()
            .repository
    }

    async fn put(router: &RepositoryRouter, repo: &str, path: &str, body: &'static [u8]) -> Result<RegistryResponse, RegistryError> {
        router
            .upload_raw(repo, NativeMethod::Put, path, &[], Bytes::from_static(body))
            .await
    }

    // Test 1: id and name resolve to the same row; missing repositories read as absent
    #[tokio::test]
    async fn test_get_repository_by_id_or_name() {
        let router = router().await;
        let repo = create(&router, "files", RepositoryType::Hosted, RepositoryConfig::default()).await;

        assert_eq!(router.get_repository(&repo.id).await.unwrap().unwrap().id, repo.id);
        assert_eq!(router.get_repository("files").await.unwrap().unwrap().id, repo.id);
        assert!(router.get_repository("nope").await.unwrap().is_none());
        assert!(router.download("nope", "a.txt").await.unwrap().is_none());
    }

    // Test 2: a second upload of the same file conflicts and keeps the first bytes
    #[tokio::test]
    async fn test_redeploy_conflict() {
        let router = router().await;
        create(&router, "files", RepositoryType::Hosted, RepositoryConfig::default()).await;

        put(&router, "files", "docs/a.txt", b"first").await.unwrap();
        let err = put(&router, "files", "docs/a.txt", b"second").await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));

        let resp = router.download("files", "docs/a.txt").await.unwrap().unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"first"));
    }

    // Test 3: group writes land in the first hosted member only
    #[tokio::test]
    async fn test_group_write_policy_first() {
        let router = router().await;
        let first = create(&router, "first", RepositoryType::Hosted, RepositoryConfig::default()).await;
        let second = create(&router, "second", RepositoryType::Hosted, RepositoryConfig::default()).await;
        let group = create(
            &router,
            "all",
            RepositoryType::Group,
            RepositoryConfig {
                members: vec!["first".to_string(), second.id.clone()],
                write_policy: WritePolicy::First,
                ..Default::default()
            },
        )
        .await;
        assert_eq!(group.config.members, vec![first.id.clone(), second.id.clone()]);

        put(&router, "all", "pkg/p.bin", b"payload").await.unwrap();

        assert!(router.download("all", "pkg/p.bin").await.unwrap().is_some());
        assert!(router.download("first", "pkg/p.bin").await.unwrap().is_some());
        assert!(router.download("second", "pkg/p.bin").await.unwrap().is_none());
        assert_eq!(router.list_versions("all", "pkg/p.bin").await.unwrap(), vec!["-"]);
    }

    // Test 4: proxies and write-less groups reject writes
    #[tokio::test]
    async fn test_writes_rejected() {
        let router = router().await;
        let proxy = create(
            &router,
            "remote",
            RepositoryType::Proxy,
            RepositoryConfig {
                upstream_url: Some("http://127.0.0.1:9".to_string()),
                ..Default::default()
            },
        )
        .await;
        create(
            &router,
            "view",
            RepositoryType::Group,
            RepositoryConfig {
                members: vec![proxy.id.clone()],
                ..Default::default()
            },
        )
        .await;

        assert!(matches!(
            put(&router, "remote", "a.txt", b"x").await.unwrap_err(),
            RegistryError::WriteRejected(_)
        ));
        assert!(matches!(
            put(&router, "view", "a.txt", b"x").await.unwrap_err(),
            RegistryError::WriteRejected(_)
        ));
    }

    // Test 5: group membership rules
    #[tokio::test]
    async fn test_group_membership_validation() {
        let router = router().await;
        let hosted = create(&router, "files", RepositoryType::Hosted, RepositoryConfig::default()).await;
        create(
            &router,
            "all",
            RepositoryType::Group,
            RepositoryConfig {
                members: vec![hosted.id.clone()],
                ..Default::default()
            },
        )
        .await;

        let nested = router
            .create_repository(request(
                "nested",
                RepositoryType::Group,
                Manager::Raw,
                RepositoryConfig {
                    members: vec!["all".to_string()],
                    ..Default::default()
                },
            ))
            .await;
        assert!(matches!(nested, Err(RegistryError::InvalidRequest(_))));

        let mixed = router
            .create_repository(request(
                "mixed",
                RepositoryType::Group,
                Manager::Npm,
                RepositoryConfig {
                    members: vec!["files".to_string()],
                    ..Default::default()
                },
            ))
            .await;
        assert!(matches!(mixed, Err(RegistryError::InvalidRequest(_))));

        let duplicate = router
            .create_repository(request("files", RepositoryType::Hosted, Manager::Raw, RepositoryConfig::default()))
            .await;
        assert!(matches!(duplicate, Err(RegistryError::Conflict(_))));
    }

    // Test 6: deleting a repository removes its rows, bytes and group membership
    #[tokio::test]
    async fn test_delete_repository() {
        let router = router().await;
        let files = create(&router, "files", RepositoryType::Hosted, RepositoryConfig::default()).await;
        create(
            &router,
            "all",
            RepositoryType::Group,
            RepositoryConfig {
                members: vec![files.id.clone()],
                ..Default::default()
            },
        )
        .await;
        put(&router, "files", "a.txt", b"x").await.unwrap();

        let change = router.delete_repository("files").await.unwrap();
        assert_eq!(change.listener, ListenerOutcome::NotApplicable);
        assert!(router.get_repository("files").await.unwrap().is_none());
        assert!(router
            .storage
            .default_backend()
            .list(&repository_prefix(&files.id))
            .await
            .unwrap()
            .is_empty());
        let group = router.get_repository("all").await.unwrap().unwrap();
        assert!(group.config.members.is_empty());
    }

    // Test 7: two container repositories cannot share a pinned port
    #[tokio::test]
    async fn test_port_conflict() {
        let config = ContainerConfig {
            host: "127.0.0.1".to_string(),
            ..Default::default()
        };
        let access = ListenerAccess::open(&config);
        let router = router().await.with_listeners(config, access);

        let docker = |port| RepositoryConfig {
            registry: Some(RegistrySettings {
                port: Some(port),
                ..Default::default()
            }),
            ..Default::default()
        };
        let first = router
            .create_repository(request("a", RepositoryType::Hosted, Manager::Docker, docker(0)))
            .await
            .unwrap();
        let ListenerOutcome::Started { port } = first.listener else {
            panic!("expected a started listener, got {:?}", first.listener);
        };
        assert_eq!(registry_port(&first.repository), Some(port));
        let stored = router.get_repository("a").await.unwrap().unwrap();
        assert_eq!(registry_port(&stored), Some(port));

        let second = router
            .create_repository(request("b", RepositoryType::Hosted, Manager::Docker, docker(port)))
            .await;
        assert!(matches!(second, Err(RegistryError::Conflict(_))));
        assert!(router.get_repository("b").await.unwrap().is_none());

        let listeners = router.listeners().unwrap();
        assert_eq!(listeners.running().await.len(), 1);

        // Unrelated changes leave the listener alone
        let mut unrelated = stored.config.clone();
        unrelated.auth_required = true;
        let change = router.update_repository("a", unrelated).await.unwrap();
        assert_eq!(change.listener, ListenerOutcome::Unchanged);

        router.shutdown().await;
        assert!(listeners.running().await.is_empty());
    }
}
