//! Compound group membership of one user within one organisation.
//!
//! Organisation-level groups and per-service groups are folded into a single
//! string-set attribute on the member record:
//!
//! ```text
//! organisationGroup/<name>
//! serviceGroup/<serviceID>/<name>
//! ```
//!
//! The store merges this attribute with set union on grant and set
//! difference on revoke, so a `GroupSet` only ever describes the tags to add
//! or remove for one change. It is a plain value: each update path builds its
//! own instance.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::types::GroupName;

pub const ORGANISATION_GROUP_TAG: &str = "organisationGroup";
pub const SERVICE_GROUP_TAG: &str = "serviceGroup";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupSetError {
    #[error("groupSet: cannot decode {tag:?} into a group")]
    InvalidTag { tag: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSet {
    organisation_groups: BTreeSet<GroupName>,
    service_groups: BTreeMap<String, BTreeSet<GroupName>>,
}

impl GroupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from organisation groups plus a service ID to groups mapping.
    pub fn from_parts<I, G, M, S, N>(organisation_groups: I, service_groups: M) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupName>,
        M: IntoIterator<Item = (S, N)>,
        S: Into<String>,
        N: IntoIterator<Item = G>,
    {
        let mut gs = Self::new();
        gs.add_organisation_groups(organisation_groups);
        for (service_id, names) in service_groups {
            gs.add_service_groups(service_id, names);
        }
        gs
    }

    /// Add organisation-level group memberships. Adding an existing one is a no-op.
    pub fn add_organisation_groups<I, G>(&mut self, names: I) -> &mut Self
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupName>,
    {
        self.organisation_groups
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// Add group memberships for one service. No names, no entry.
    pub fn add_service_groups<S, I, G>(&mut self, service_id: S, names: I) -> &mut Self
    where
        S: Into<String>,
        I: IntoIterator<Item = G>,
        G: Into<GroupName>,
    {
        let mut names = names.into_iter().map(Into::into).peekable();
        if names.peek().is_none() {
            return self;
        }
        self.service_groups
            .entry(service_id.into())
            .or_default()
            .extend(names);
        self
    }

    pub fn with_organisation_groups<I, G>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupName>,
    {
        self.add_organisation_groups(names);
        self
    }

    pub fn with_service_groups<S, I, G>(mut self, service_id: S, names: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = G>,
        G: Into<GroupName>,
    {
        self.add_service_groups(service_id, names);
        self
    }

    pub fn organisation_groups(&self) -> &BTreeSet<GroupName> {
        &self.organisation_groups
    }

    pub fn service_groups(&self) -> &BTreeMap<String, BTreeSet<GroupName>> {
        &self.service_groups
    }

    pub fn is_empty(&self) -> bool {
        self.organisation_groups.is_empty() && self.service_groups.is_empty()
    }

    /// Fold `other` into this set.
    pub fn union(&mut self, other: &GroupSet) -> &mut Self {
        self.add_organisation_groups(other.organisation_groups.iter().cloned());
        for (service_id, names) in &other.service_groups {
            self.add_service_groups(service_id.clone(), names.iter().cloned());
        }
        self
    }

    /// The tagged strings stored in the member record's `groups` attribute.
    pub fn encode(&self) -> BTreeSet<String> {
        let organisation = self
            .organisation_groups
            .iter()
            .map(|g| format!("{}/{}", ORGANISATION_GROUP_TAG, g));
        let services = self.service_groups.iter().flat_map(|(service_id, names)| {
            names
                .iter()
                .map(move |g| format!("{}/{}/{}", SERVICE_GROUP_TAG, service_id, g))
        });
        organisation.chain(services).collect()
    }

    /// Inverse of [`GroupSet::encode`].
    ///
    /// Tags with an unknown prefix are skipped. A tag without the segments its
    /// prefix needs is an error. Group names may themselves contain `/`.
    pub fn decode<I, S>(tags: I) -> Result<Self, GroupSetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut gs = Self::new();
        for tag in tags {
            let tag = tag.as_ref();
            let invalid = || GroupSetError::InvalidTag {
                tag: tag.to_string(),
            };
            let (prefix, rest) = tag.split_once('/').ok_or_else(invalid)?;
            match prefix {
                ORGANISATION_GROUP_TAG => {
                    gs.add_organisation_groups([rest]);
                }
                SERVICE_GROUP_TAG => {
                    let (service_id, name) = rest.split_once('/').ok_or_else(invalid)?;
                    gs.add_service_groups(service_id, [name]);
                }
                _ => {}
            }
        }
        Ok(gs)
    }
}
