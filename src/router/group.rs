//! Group repository resolution
//!
//! A group is an ordered list of same-manager hosted and proxy repositories.
//! Reads go to the members in order and stop at the first hit; writes go to
//! exactly one hosted member chosen by the group's write policy.

use std::future::Future;

use tracing::{debug, warn};

use crate::database::Database;
use crate::error::RegistryError;
use crate::models::{Repository, RepositoryType, WritePolicy};
use crate::plugins::registry::version;

/// A group with its members loaded
#[derive(Debug, Clone)]
pub struct GroupRouter {
    group: Repository,
    members: Vec<Repository>,
}

impl GroupRouter {
    /// Group over already-resolved members, in order
    pub fn new(group: Repository, members: Vec<Repository>) -> Self {
        Self { group, members }
    }

    /// Load a group's members, skipping ids that no longer resolve
    pub async fn load(db: &dyn Database, group: Repository) -> Result<Self, RegistryError> {
        let mut members = Vec::with_capacity(group.config.members.len());
        for id in &group.config.members {
            match db.get_repository(id).await? {
                Some(member) => members.push(member),
                None => warn!(group = %group.name, member = %id, "Group member no longer exists; skipping"),
            }
        }
        Ok(Self::new(group, members))
    }

    pub fn group(&self) -> &Repository {
        &self.group
    }

    pub fn members(&self) -> &[Repository] {
        &self.members
    }

    /// The member that receives writes sent to the group
    pub fn write_target(&self) -> Result<&Repository, RegistryError> {
        if self.group.config.write_policy == WritePolicy::None {
            return Err(RegistryError::WriteRejected(format!(
                "group '{}' does not accept writes",
                self.group.name
            )));
        }

        if let Some(preferred) = &self.group.config.preferred_writer {
            let member = self
                .members
                .iter()
                .find(|m| &m.id == preferred || &m.name == preferred)
                .ok_or_else(|| {
                    RegistryError::WriteRejected(format!(
                        "preferred writer '{}' of group '{}' does not exist",
                        preferred, self.group.name
                    ))
                })?;
            if member.repo_type != RepositoryType::Hosted {
                return Err(RegistryError::WriteRejected(format!(
                    "preferred writer '{}' of group '{}' is not hosted",
                    member.name, self.group.name
                )));
            }
            return Ok(member);
        }

        self.members
            .iter()
            .find(|m| m.repo_type == RepositoryType::Hosted)
            .ok_or_else(|| {
                RegistryError::WriteRejected(format!(
                    "group '{}' has no hosted member to write to",
                    self.group.name
                ))
            })
    }

    /// First member answering with `Some`
    ///
    /// A failing member is skipped; its error is reported only when no member
    /// answered and every member failed.
    pub async fn first_hit<T, F, Fut>(&self, mut lookup: F) -> Result<Option<T>, RegistryError>
    where
        F: FnMut(Repository) -> Fut,
        Fut: Future<Output = Result<Option<T>, RegistryError>>,
    {
        let mut last_error = None;
        let mut failures = 0;
        for member in &self.members {
            match lookup(member.clone()).await {
                Ok(Some(found)) => {
                    debug!(group = %self.group.name, member = %member.name, "Group read served by member");
                    return Ok(Some(found));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(group = %self.group.name, member = %member.name, error = %e, "Group member failed; trying next");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if failures == self.members.len() => Err(e),
            _ => Ok(None),
        }
    }

    /// Ascending union of every member's versions
    pub fn union_versions(lists: &[Vec<String>]) -> Vec<String> {
        version::sorted_distinct(lists.iter().flatten().map(String::as_str))
    }
}
