//! Registry plugins for the supported package ecosystems
//!
//! Every ecosystem implements [`RegistryPlugin`]; the [`PluginRegistry`] maps
//! each [`Manager`] to its plugin and is built once at startup.
//!
//! Shared building blocks:
//! - [`hosted`]: storage and row bookkeeping for hosted repositories
//! - [`version`]: version ordering across ecosystems
//! - [`archive`], [`multipart`]: package and request body formats

pub mod archive;
pub mod hosted;
pub mod multipart;
pub mod traits;
pub mod version;

// Registry plugin implementations
pub mod cargo;
pub mod composer;
pub mod docker;
pub mod helm;
pub mod maven;
pub mod npm;
pub mod nuget;
pub mod pypi;
pub mod raw;

use std::collections::HashMap;
use std::sync::Arc;

pub use traits::{
    LoginRequest, LoginResponse, NativeMethod, PluginContext, RegistryPlugin, RegistryResponse,
    UploadRequest,
};

use crate::container::ListenerManager;
use crate::error::PluginError;
use crate::models::Manager;

/// Manager to plugin lookup
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<Manager, Arc<dyn RegistryPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in plugin; the container plugin drives `listeners`
    pub fn with_defaults(listeners: Option<Arc<ListenerManager>>) -> Self {
        let docker = match listeners {
            Some(listeners) => docker::DockerPlugin::with_listeners(listeners),
            None => docker::DockerPlugin::new(),
        };
        Self::new()
            .register(Arc::new(npm::NpmPlugin::new()))
            .register(Arc::new(maven::MavenPlugin::new()))
            .register(Arc::new(nuget::NugetPlugin::new()))
            .register(Arc::new(pypi::PypiPlugin::new()))
            .register(Arc::new(composer::ComposerPlugin::new()))
            .register(Arc::new(helm::HelmPlugin::new()))
            .register(Arc::new(cargo::CargoPlugin::new()))
            .register(Arc::new(docker))
            .register(Arc::new(raw::RawPlugin::new()))
    }

    /// Add or replace the plugin for its manager
    pub fn register(mut self, plugin: Arc<dyn RegistryPlugin>) -> Self {
        self.plugins.insert(plugin.manager(), plugin);
        self
    }

    pub fn get(&self, manager: Manager) -> Result<Arc<dyn RegistryPlugin>, PluginError> {
        self.plugins
            .get(&manager)
            .cloned()
            .ok_or_else(|| PluginError::Unsupported(format!("no plugin for {}", manager)))
    }

    /// Managers with a registered plugin, in declaration order
    pub fn managers(&self) -> Vec<Manager> {
        Manager::ALL
            .into_iter()
            .filter(|m| self.plugins.contains_key(m))
            .collect()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("managers", &self.managers())
            .finish()
    }
}
