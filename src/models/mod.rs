//! Domain models for artifact-depot
//!
//! This module contains the core domain models used throughout the application.

pub mod artifact;
pub mod repository;
pub mod token;

// Re-export commonly used types
pub use artifact::{Artifact, PackageDetails, Provenance, VersionSummary};
pub use repository::{
    CreateRepositoryRequest, Manager, RegistrySettings, Repository, RepositoryCacheConfig,
    RepositoryConfig, RepositoryType, UpstreamAuth, WritePolicy,
};
pub use token::{
    Action, ApiToken, CreateTokenRequest, CreateTokenResponse, PermissionGrant, Principal,
    ADMIN_PRINCIPAL, ANONYMOUS_PRINCIPAL,
};
