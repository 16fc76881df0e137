use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved group for organisation owners. Convention only.
pub const GROUP_OWNER: &str = "owner";
/// Reserved group for ordinary members. Convention only.
pub const GROUP_MEMBER: &str = "member";

/// Name of an organisation-level or service-level group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupName(pub String);

impl GroupName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn owner() -> Self {
        Self::new(GROUP_OWNER)
    }

    pub fn member() -> Self {
        Self::new(GROUP_MEMBER)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for GroupName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for GroupName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl Borrow<str> for GroupName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A user of the system, identified by lower-cased email address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        email: &str,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        phone: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: normalize_email(email),
            first_name: first_name.into(),
            last_name: last_name.into(),
            phone: phone.into(),
            created_at,
        }
    }
}

/// Canonical form of a user ID.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// An organisation users can join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organisation {
    pub id: String,
    pub name: String,
}

impl Organisation {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// An invitation for a user to join an organisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub organisation: Organisation,
    pub invited_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

impl Invitation {
    pub fn is_pending(&self) -> bool {
        self.accepted_at.is_none()
    }
}

/// A user with every organisation relationship they hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDetails {
    #[serde(flatten)]
    pub user: User,
    /// Organisations whose invitation has been accepted.
    pub organisations: Vec<Organisation>,
    /// Pending invitations only.
    pub invitations: Vec<Invitation>,
}

/// A service owned by exactly one organisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub groups: BTreeMap<GroupName, Vec<User>>,
}

impl Service {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            groups: BTreeMap::new(),
        }
    }

    /// Members of `group`; empty when the group has none.
    pub fn members_of(&self, group: &str) -> &[User] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// An organisation with its group memberships and services.
///
/// Groups are ordered by name and services by scan order. The order of
/// users inside a group is not part of the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganisationDetails {
    #[serde(flatten)]
    pub organisation: Organisation,
    pub groups: BTreeMap<GroupName, Vec<User>>,
    pub services: Vec<Service>,
}

impl OrganisationDetails {
    /// Members of the organisation-level `group`.
    pub fn members_of(&self, group: &str) -> &[User] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn service(&self, id: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }
}
