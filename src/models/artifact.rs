//! Artifact domain models
//!
//! An artifact is one stored file of a package version. Single-file ecosystems
//! have exactly one per version; Maven, PyPI and raw repositories may attach
//! further files to the same version under distinct paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an artifact was built
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// VCS commit the artifact was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,

    /// CI build identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,

    /// Source repository URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_repo_url: Option<String>,
}

impl Provenance {
    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        self.commit_sha.is_none() && self.build_id.is_none() && self.source_repo_url.is_none()
    }
}

/// A stored artifact row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Stable identifier
    pub id: String,

    /// Owning repository
    pub repository_id: String,

    /// Package name in the ecosystem's canonical form
    pub name: String,

    /// Version, tag or digest
    pub version: String,

    /// File name within the version
    pub path: String,

    /// Key of the bytes in storage
    pub storage_key: String,

    /// Hex SHA-256 of the bytes
    pub content_hash: String,

    /// Size in bytes
    pub size: u64,

    /// MIME type served on download
    pub content_type: String,

    /// Ecosystem-specific metadata (npm version manifest, cargo index entry...)
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Build provenance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,

    /// Upload time
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Create an artifact with a fresh id and the current time
    pub fn new(
        repository_id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            repository_id: repository_id.into(),
            name: name.into(),
            version: version.into(),
            path: path.into(),
            storage_key: String::new(),
            content_hash: String::new(),
            size: 0,
            content_type: "application/octet-stream".to_string(),
            metadata: serde_json::Value::Null,
            provenance: None,
            created_at: Utc::now(),
        }
    }

    /// Set storage location and content facts
    pub fn with_content(
        mut self,
        storage_key: impl Into<String>,
        content_hash: impl Into<String>,
        size: u64,
    ) -> Self {
        self.storage_key = storage_key.into();
        self.content_hash = content_hash.into();
        self.size = size;
        self
    }

    /// Set the MIME type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set ecosystem metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set provenance, dropping it when empty
    pub fn with_provenance(mut self, provenance: Option<Provenance>) -> Self {
        self.provenance = provenance.filter(|p| !p.is_empty());
        self
    }
}

/// One version in a package listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    /// Version string
    pub version: String,

    /// Files attached to the version
    pub files: Vec<String>,

    /// Total size of all files
    pub size: u64,

    /// Hash of the primary file
    pub content_hash: String,

    /// Earliest upload time among the files, unknown for proxied versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Build provenance of the primary file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

/// Package details returned by `get_package_details`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDetails {
    /// Package name
    pub name: String,

    /// Highest version by ecosystem ordering
    pub latest: Option<String>,

    /// Versions, oldest first
    pub versions: Vec<VersionSummary>,
}

impl PackageDetails {
    /// Group artifact rows of one package into per-version summaries
    ///
    /// `latest` is supplied by the caller because ordering is ecosystem-specific.
    pub fn from_artifacts(name: &str, artifacts: &[Artifact], latest: Option<String>) -> Self {
        let mut versions: Vec<VersionSummary> = Vec::new();
        for artifact in artifacts {
            match versions.iter_mut().find(|v| v.version == artifact.version) {
                Some(summary) => {
                    summary.files.push(artifact.path.clone());
                    summary.size += artifact.size;
                    if Some(artifact.created_at) < summary.created_at {
                        summary.created_at = Some(artifact.created_at);
                    }
                }
                None => versions.push(VersionSummary {
                    version: artifact.version.clone(),
                    files: vec![artifact.path.clone()],
                    size: artifact.size,
                    content_hash: artifact.content_hash.clone(),
                    created_at: Some(artifact.created_at),
                    provenance: artifact.provenance.clone(),
                }),
            }
        }
        versions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        Self {
            name: name.to_string(),
            latest,
            versions,
        }
    }

    /// Details known only by version string, as reported by an upstream index
    pub fn from_versions(name: &str, versions: Vec<String>, latest: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            latest,
            versions: versions
                .into_iter()
                .map(|version| VersionSummary {
                    version,
                    files: Vec::new(),
                    size: 0,
                    content_hash: String::new(),
                    created_at: None,
                    provenance: None,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Empty provenance is dropped
    #[test]
    fn test_empty_provenance_dropped() {
        let a = Artifact::new("r", "pkg", "1.0.0", "pkg-1.0.0.tgz")
            .with_provenance(Some(Provenance::default()));
        assert!(a.provenance.is_none());

        let a = Artifact::new("r", "pkg", "1.0.0", "pkg-1.0.0.tgz").with_provenance(Some(
            Provenance {
                commit_sha: Some("abc123".to_string()),
                ..Default::default()
            },
        ));
        assert_eq!(
            a.provenance.unwrap().commit_sha,
            Some("abc123".to_string())
        );
    }

    // Test 2: Files of one version are grouped
    #[test]
    fn test_package_details_groups_files() {
        let sdist = Artifact::new("r", "demo", "1.0", "demo-1.0.tar.gz").with_content("k1", "h1", 10);
        let wheel = Artifact::new("r", "demo", "1.0", "demo-1.0-py3-none-any.whl")
            .with_content("k2", "h2", 20);
        let next = Artifact::new("r", "demo", "1.1", "demo-1.1.tar.gz").with_content("k3", "h3", 5);

        let details =
            PackageDetails::from_artifacts("demo", &[sdist, wheel, next], Some("1.1".to_string()));

        assert_eq!(details.versions.len(), 2);
        assert_eq!(details.versions[0].version, "1.0");
        assert_eq!(details.versions[0].files.len(), 2);
        assert_eq!(details.versions[0].size, 30);
        assert_eq!(details.latest, Some("1.1".to_string()));
    }
}
