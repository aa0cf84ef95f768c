//! Repository domain models
//!
//! A repository is a named, typed container of artifacts served through one
//! ecosystem plugin. Its configuration is stored as JSON next to the row.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// How a repository obtains its content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    /// Artifacts stored and served directly
    Hosted,
    /// Cached copies of an external registry
    Proxy,
    /// Virtual aggregate of other repositories
    Group,
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepositoryType::Hosted => "hosted",
            RepositoryType::Proxy => "proxy",
            RepositoryType::Group => "group",
        };
        f.write_str(s)
    }
}

impl FromStr for RepositoryType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hosted" => Ok(RepositoryType::Hosted),
            "proxy" => Ok(RepositoryType::Proxy),
            "group" => Ok(RepositoryType::Group),
            other => Err(ParseError::MissingParameter(format!(
                "unknown repository type '{}'",
                other
            ))),
        }
    }
}

/// Package ecosystem handled by a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Manager {
    /// npm / yarn / pnpm
    Npm,
    /// Maven 2 layout
    Maven,
    /// NuGet v3
    Nuget,
    /// PyPI simple index
    Pypi,
    /// PHP Composer
    Composer,
    /// Helm chart repository
    Helm,
    /// Cargo sparse registry
    Cargo,
    /// OCI / Docker distribution
    Docker,
    /// Arbitrary files
    Raw,
}

impl Manager {
    /// Every supported manager, in display order
    pub const ALL: [Manager; 9] = [
        Manager::Npm,
        Manager::Maven,
        Manager::Nuget,
        Manager::Pypi,
        Manager::Composer,
        Manager::Helm,
        Manager::Cargo,
        Manager::Docker,
        Manager::Raw,
    ];

    /// Lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Manager::Npm => "npm",
            Manager::Maven => "maven",
            Manager::Nuget => "nuget",
            Manager::Pypi => "pypi",
            Manager::Composer => "composer",
            Manager::Helm => "helm",
            Manager::Cargo => "cargo",
            Manager::Docker => "docker",
            Manager::Raw => "raw",
        }
    }
}

impl fmt::Display for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Manager {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Manager::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == lower)
            .or(match lower.as_str() {
                "oci" | "container" => Some(Manager::Docker),
                "rust" | "crates" => Some(Manager::Cargo),
                "python" => Some(Manager::Pypi),
                _ => None,
            })
            .ok_or_else(|| ParseError::MissingParameter(format!("unknown manager '{}'", s)))
    }
}

/// Which group member receives writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    /// First hosted member in declaration order
    #[default]
    First,
    /// Writes are rejected regardless of members
    None,
}

/// Credentials the proxy presents to its upstream
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamAuth {
    /// Username
    pub username: String,
    /// Password or token
    pub password: String,
}

impl fmt::Debug for UpstreamAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Proxy cache knobs that override the global defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryCacheConfig {
    /// TTL recorded on cache entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,

    /// Sweep retention window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_secs: Option<u64>,

    /// Sweep entry ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
}

/// Settings of the container registry listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Pinned port; `Some(0)` asks for an ephemeral port that is then persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Distribution protocol version advertised by the listener
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            port: None,
            protocol_version: default_protocol_version(),
        }
    }
}

fn default_protocol_version() -> String {
    "registry/2.0".to_string()
}

/// Type-dependent repository configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Upstream base URL (proxy only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_url: Option<String>,

    /// Credentials for the upstream (proxy only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_auth: Option<UpstreamAuth>,

    /// Ordered member repository ids (group only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,

    /// Write routing rule (group only)
    #[serde(default)]
    pub write_policy: WritePolicy,

    /// Member id that receives every write (group only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_writer: Option<String>,

    /// Cache overrides (proxy only)
    #[serde(default)]
    pub cache: RepositoryCacheConfig,

    /// Named storage backend instead of the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_backend: Option<String>,

    /// Whether reads require credentials
    #[serde(default)]
    pub auth_required: bool,

    /// Whether an existing (name, version) may be overwritten
    #[serde(default)]
    pub allow_redeploy: bool,

    /// Container listener settings (docker manager only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistrySettings>,

    /// Free-form manager-specific settings
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RepositoryConfig {
    /// Fields whose change requires the container listener to restart
    pub fn listener_fingerprint(&self) -> (Option<u16>, &[String], WritePolicy, Option<&str>) {
        (
            self.registry.as_ref().and_then(|r| r.port),
            &self.members,
            self.write_policy,
            self.preferred_writer.as_deref(),
        )
    }
}

/// A repository row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    /// Stable identifier
    pub id: String,

    /// Unique human name
    pub name: String,

    /// Hosted, proxy or group
    #[serde(rename = "type")]
    pub repo_type: RepositoryType,

    /// Ecosystem
    pub manager: Manager,

    /// Type-dependent settings
    pub config: RepositoryConfig,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last settings change
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    /// Build a new repository with a fresh id
    pub fn new(
        name: impl Into<String>,
        repo_type: RepositoryType,
        manager: Manager,
        config: RepositoryConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            repo_type,
            manager,
            config,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this repository runs a container registry listener
    pub fn runs_listener(&self) -> bool {
        self.manager == Manager::Docker
    }

    /// Validate the type-dependent configuration
    ///
    /// Membership rules that need other rows (same manager, no nesting) are
    /// checked by the router.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.name.trim().is_empty() {
            return Err(ParseError::MissingParameter("name".to_string()));
        }
        if self.name.contains('/') {
            return Err(ParseError::InvalidPackageName(format!(
                "repository name '{}' must not contain '/'",
                self.name
            )));
        }

        match self.repo_type {
            RepositoryType::Proxy => {
                let url = self
                    .config
                    .upstream_url
                    .as_deref()
                    .ok_or_else(|| ParseError::MissingParameter("upstream_url".to_string()))?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ParseError::InvalidPath(format!(
                        "upstream_url '{}' is not an http(s) URL",
                        url
                    )));
                }
            }
            RepositoryType::Group => {
                if self.config.members.iter().any(|m| m == &self.id) {
                    return Err(ParseError::InvalidPath(
                        "a group cannot contain itself".to_string(),
                    ));
                }
                if let Some(writer) = &self.config.preferred_writer {
                    if !self.config.members.contains(writer) {
                        return Err(ParseError::InvalidPath(format!(
                            "preferred writer '{}' is not a member",
                            writer
                        )));
                    }
                }
            }
            RepositoryType::Hosted => {}
        }

        if self.config.registry.is_some() && !self.runs_listener() {
            return Err(ParseError::InvalidPath(
                "registry settings are only valid for container repositories".to_string(),
            ));
        }

        Ok(())
    }
}

/// Request body for creating a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRepositoryRequest {
    /// Unique name
    pub name: String,

    /// Repository type
    #[serde(rename = "type")]
    pub repo_type: RepositoryType,

    /// Ecosystem
    pub manager: Manager,

    /// Settings
    #[serde(default)]
    pub config: RepositoryConfig,
}
