//! Stored record shapes and their keys.
//!
//! Every record carries the header `id` (partition key), `rng` (sort key),
//! `typ` (record kind) and `v` (schema version, always 0). Keys are built by
//! plain concatenation with `/`:
//!
//! | kind                  | id                      | rng                                |
//! |-----------------------|-------------------------|------------------------------------|
//! | `user`                | `user/<email>`          | `user`                             |
//! | `userOrganisation`    | `user/<email>`          | `userOrganisation/<orgID>`         |
//! | `organisation`        | `organisation/<orgID>`  | `organisation`                     |
//! | `organisationMember`  | `organisation/<orgID>`  | `organisationGroupMember/<email>`  |
//! | `organisationService` | `organisation/<orgID>`  | `organisationService/<serviceID>`  |

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::backend::{AttributeValue, Item, Key, UpdateSpec};
use crate::error::DecodeError;
use crate::groupset::GroupSet;
use crate::types::{Organisation, User};

pub const KIND_ATTR: &str = "typ";
pub const VERSION_ATTR: &str = "v";
pub const SCHEMA_VERSION: i64 = 0;

/// Payload attribute names.
pub mod field {
    pub const ORGANISATION_ID: &str = "organisationId";
    pub const ORGANISATION_NAME: &str = "organisationName";
    pub const SERVICE_ID: &str = "serviceId";
    pub const SERVICE_NAME: &str = "serviceName";
    pub const GROUPS: &str = "groups";
    pub const EMAIL: &str = "email";
    pub const FIRST_NAME: &str = "firstName";
    pub const LAST_NAME: &str = "lastName";
    pub const PHONE: &str = "phone";
    pub const CREATED_AT: &str = "createdAt";
    pub const INVITED_AT: &str = "invitedAt";
    pub const ACCEPTED_AT: &str = "acceptedAt";
}

const USER_PREFIX: &str = "user";
const ORGANISATION_PREFIX: &str = "organisation";
const MEMBER_SORT_PREFIX: &str = "organisationGroupMember";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    User,
    UserOrganisation,
    Organisation,
    OrganisationMember,
    OrganisationService,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::User => "user",
            RecordKind::UserOrganisation => "userOrganisation",
            RecordKind::Organisation => "organisation",
            RecordKind::OrganisationMember => "organisationMember",
            RecordKind::OrganisationService => "organisationService",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "user" => Some(RecordKind::User),
            "userOrganisation" => Some(RecordKind::UserOrganisation),
            "organisation" => Some(RecordKind::Organisation),
            "organisationMember" => Some(RecordKind::OrganisationMember),
            "organisationService" => Some(RecordKind::OrganisationService),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn user_partition(email: &str) -> String {
    format!("{}/{}", USER_PREFIX, email)
}

pub fn organisation_partition(organisation_id: &str) -> String {
    format!("{}/{}", ORGANISATION_PREFIX, organisation_id)
}

pub fn user_key(email: &str) -> Key {
    Key::new(user_partition(email), RecordKind::User.as_str())
}

pub fn user_organisation_key(email: &str, organisation_id: &str) -> Key {
    Key::new(
        user_partition(email),
        format!("{}/{}", RecordKind::UserOrganisation, organisation_id),
    )
}

pub fn organisation_key(organisation_id: &str) -> Key {
    Key::new(
        organisation_partition(organisation_id),
        RecordKind::Organisation.as_str(),
    )
}

pub fn organisation_member_key(organisation_id: &str, email: &str) -> Key {
    Key::new(
        organisation_partition(organisation_id),
        format!("{}/{}", MEMBER_SORT_PREFIX, email),
    )
}

pub fn organisation_service_key(organisation_id: &str, service_id: &str) -> Key {
    Key::new(
        organisation_partition(organisation_id),
        format!("{}/{}", RecordKind::OrganisationService, service_id),
    )
}

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn header(key: &Key, kind: RecordKind) -> Item {
    let mut item = key.to_item();
    item.insert(KIND_ATTR.to_string(), AttributeValue::string(kind.as_str()));
    item.insert(VERSION_ATTR.to_string(), AttributeValue::number(SCHEMA_VERSION));
    item
}

fn insert_s(item: &mut Item, name: &str, value: impl Into<String>) {
    item.insert(name.to_string(), AttributeValue::string(value));
}

fn insert_profile(item: &mut Item, user: &User) {
    insert_s(item, field::EMAIL, &user.id);
    insert_s(item, field::FIRST_NAME, &user.first_name);
    insert_s(item, field::LAST_NAME, &user.last_name);
    insert_s(item, field::PHONE, &user.phone);
    insert_s(item, field::CREATED_AT, format_timestamp(&user.created_at));
}

/// Typed access to one item's attributes, producing decode errors that name
/// the record kind, key and field.
struct Fields<'a> {
    kind: RecordKind,
    key: String,
    item: &'a Item,
}

impl<'a> Fields<'a> {
    fn new(kind: RecordKind, item: &'a Item) -> Self {
        let key = Key::of_item(item)
            .map(|k| k.to_string())
            .unwrap_or_else(|| "<no key>".to_string());
        Self { kind, key, item }
    }

    fn missing(&self, field: &'static str) -> DecodeError {
        DecodeError::MissingField {
            kind: self.kind.as_str(),
            key: self.key.clone(),
            field,
        }
    }

    fn wrong_type(&self, field: &'static str, expected: &'static str) -> DecodeError {
        DecodeError::WrongType {
            kind: self.kind.as_str(),
            key: self.key.clone(),
            field,
            expected,
        }
    }

    fn malformed(&self, field: &'static str, reason: impl fmt::Display) -> DecodeError {
        DecodeError::Malformed {
            kind: self.kind.as_str(),
            key: self.key.clone(),
            field,
            reason: reason.to_string(),
        }
    }

    fn string(&self, field: &'static str) -> Result<String, DecodeError> {
        match self.item.get(field) {
            None => Err(self.missing(field)),
            Some(AttributeValue::S(s)) => Ok(s.clone()),
            Some(_) => Err(self.wrong_type(field, "string")),
        }
    }

    fn timestamp(&self, field: &'static str) -> Result<DateTime<Utc>, DecodeError> {
        let raw = self.string(field)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|e| self.malformed(field, e))
    }

    fn optional_timestamp(&self, field: &'static str) -> Result<Option<DateTime<Utc>>, DecodeError> {
        match self.item.get(field) {
            None | Some(AttributeValue::Null) => Ok(None),
            Some(AttributeValue::S(_)) => self.timestamp(field).map(Some),
            Some(_) => Err(self.wrong_type(field, "string or null")),
        }
    }

    /// Absent means empty.
    fn string_set(&self, field: &'static str) -> Result<BTreeSet<String>, DecodeError> {
        match self.item.get(field) {
            None | Some(AttributeValue::Null) => Ok(BTreeSet::new()),
            Some(AttributeValue::Ss(set)) => Ok(set.clone()),
            Some(_) => Err(self.wrong_type(field, "string set")),
        }
    }

    fn version(&self) -> Result<i64, DecodeError> {
        match self.item.get(VERSION_ATTR) {
            None => Ok(SCHEMA_VERSION),
            Some(AttributeValue::N(n)) => n
                .parse::<i64>()
                .map_err(|e| self.malformed(VERSION_ATTR, e)),
            Some(_) => Err(self.wrong_type(VERSION_ATTR, "number")),
        }
    }

    fn partition_id(&self, prefix: &str) -> Result<String, DecodeError> {
        let partition = self.string(crate::backend::PARTITION_KEY)?;
        partition
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
            .ok_or_else(|| {
                self.malformed(
                    crate::backend::PARTITION_KEY,
                    format!("expected a {}/ partition", prefix),
                )
            })
    }

    fn profile(&self) -> Result<User, DecodeError> {
        Ok(User {
            id: self.string(field::EMAIL)?,
            first_name: self.string(field::FIRST_NAME)?,
            last_name: self.string(field::LAST_NAME)?,
            phone: self.string(field::PHONE)?,
            created_at: self.timestamp(field::CREATED_AT)?,
        })
    }
}

/// The base record of a user partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user: User,
}

impl UserRecord {
    pub fn new(user: User) -> Self {
        Self { user }
    }

    pub fn key(&self) -> Key {
        user_key(&self.user.id)
    }

    pub fn to_item(&self) -> Item {
        let mut item = header(&self.key(), RecordKind::User);
        insert_profile(&mut item, &self.user);
        item
    }

    pub fn from_item(item: &Item) -> Result<Self, DecodeError> {
        let fields = Fields::new(RecordKind::User, item);
        fields.version()?;
        Ok(Self {
            user: fields.profile()?,
        })
    }
}

/// A user's side of an organisation relationship; pending while
/// `accepted_at` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOrganisationRecord {
    pub email: String,
    pub organisation: Organisation,
    pub invited_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

impl UserOrganisationRecord {
    pub fn key(&self) -> Key {
        user_organisation_key(&self.email, &self.organisation.id)
    }

    pub fn to_item(&self) -> Item {
        let mut item = header(&self.key(), RecordKind::UserOrganisation);
        insert_s(&mut item, field::EMAIL, &self.email);
        insert_s(&mut item, field::ORGANISATION_ID, &self.organisation.id);
        insert_s(&mut item, field::ORGANISATION_NAME, &self.organisation.name);
        insert_s(&mut item, field::INVITED_AT, format_timestamp(&self.invited_at));
        let accepted = match &self.accepted_at {
            Some(at) => AttributeValue::string(format_timestamp(at)),
            None => AttributeValue::Null,
        };
        item.insert(field::ACCEPTED_AT.to_string(), accepted);
        item
    }

    pub fn from_item(item: &Item) -> Result<Self, DecodeError> {
        let fields = Fields::new(RecordKind::UserOrganisation, item);
        fields.version()?;
        Ok(Self {
            email: fields.string(field::EMAIL)?,
            organisation: Organisation::new(
                fields.string(field::ORGANISATION_ID)?,
                fields.string(field::ORGANISATION_NAME)?,
            ),
            invited_at: fields.timestamp(field::INVITED_AT)?,
            accepted_at: fields.optional_timestamp(field::ACCEPTED_AT)?,
        })
    }

    /// Update that marks the relationship accepted at `at`.
    pub fn accept(at: &DateTime<Utc>) -> UpdateSpec {
        UpdateSpec::new().set(
            field::ACCEPTED_AT,
            AttributeValue::string(format_timestamp(at)),
        )
    }
}

/// The base record of an organisation partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganisationRecord {
    pub organisation: Organisation,
}

impl OrganisationRecord {
    pub fn new(organisation: Organisation) -> Self {
        Self { organisation }
    }

    pub fn key(&self) -> Key {
        organisation_key(&self.organisation.id)
    }

    pub fn to_item(&self) -> Item {
        let mut item = header(&self.key(), RecordKind::Organisation);
        insert_s(&mut item, field::ORGANISATION_ID, &self.organisation.id);
        insert_s(&mut item, field::ORGANISATION_NAME, &self.organisation.name);
        item
    }

    pub fn from_item(item: &Item) -> Result<Self, DecodeError> {
        let fields = Fields::new(RecordKind::Organisation, item);
        fields.version()?;
        Ok(Self {
            organisation: Organisation::new(
                fields.string(field::ORGANISATION_ID)?,
                fields.string(field::ORGANISATION_NAME)?,
            ),
        })
    }
}

/// A user's membership of an organisation: a copy of their profile plus the
/// group tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganisationMemberRecord {
    pub organisation_id: String,
    pub user: User,
    pub groups: GroupSet,
}

impl OrganisationMemberRecord {
    pub fn key(&self) -> Key {
        organisation_member_key(&self.organisation_id, &self.user.id)
    }

    pub fn to_item(&self) -> Item {
        let mut item = header(&self.key(), RecordKind::OrganisationMember);
        insert_s(&mut item, field::ORGANISATION_ID, &self.organisation_id);
        insert_profile(&mut item, &self.user);
        let tags = self.groups.encode();
        // Empty string sets cannot be stored.
        if !tags.is_empty() {
            item.insert(field::GROUPS.to_string(), AttributeValue::Ss(tags));
        }
        item
    }

    pub fn from_item(item: &Item) -> Result<Self, DecodeError> {
        let fields = Fields::new(RecordKind::OrganisationMember, item);
        fields.version()?;
        let tags = fields.string_set(field::GROUPS)?;
        let groups = GroupSet::decode(&tags).map_err(|e| fields.malformed(field::GROUPS, e))?;
        Ok(Self {
            organisation_id: fields.string(field::ORGANISATION_ID)?,
            user: fields.profile()?,
            groups,
        })
    }

    /// Upsert of the member header and profile copy, leaving `groups` alone.
    pub fn profile_upsert(organisation_id: &str, user: &User) -> UpdateSpec {
        UpdateSpec::new()
            .set(KIND_ATTR, AttributeValue::string(RecordKind::OrganisationMember.as_str()))
            .set(VERSION_ATTR, AttributeValue::number(SCHEMA_VERSION))
            .set(field::ORGANISATION_ID, AttributeValue::string(organisation_id))
            .set(field::EMAIL, AttributeValue::string(&user.id))
            .set(field::FIRST_NAME, AttributeValue::string(&user.first_name))
            .set(field::LAST_NAME, AttributeValue::string(&user.last_name))
            .set(field::PHONE, AttributeValue::string(&user.phone))
            .set(field::CREATED_AT, AttributeValue::string(format_timestamp(&user.created_at)))
    }

    /// Update of the mutable profile fields only.
    pub fn profile_update(user: &User) -> UpdateSpec {
        UpdateSpec::new()
            .set(field::FIRST_NAME, AttributeValue::string(&user.first_name))
            .set(field::LAST_NAME, AttributeValue::string(&user.last_name))
            .set(field::PHONE, AttributeValue::string(&user.phone))
    }
}

/// A service registered under an organisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganisationServiceRecord {
    pub organisation_id: String,
    pub service_id: String,
    pub service_name: String,
}

impl OrganisationServiceRecord {
    pub fn key(&self) -> Key {
        organisation_service_key(&self.organisation_id, &self.service_id)
    }

    pub fn to_item(&self) -> Item {
        let mut item = header(&self.key(), RecordKind::OrganisationService);
        insert_s(&mut item, field::SERVICE_ID, &self.service_id);
        insert_s(&mut item, field::SERVICE_NAME, &self.service_name);
        item
    }

    pub fn from_item(item: &Item) -> Result<Self, DecodeError> {
        let fields = Fields::new(RecordKind::OrganisationService, item);
        fields.version()?;
        Ok(Self {
            organisation_id: fields.partition_id(ORGANISATION_PREFIX)?,
            service_id: fields.string(field::SERVICE_ID)?,
            service_name: fields.string(field::SERVICE_NAME)?,
        })
    }
}

/// A decoded item of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    User(UserRecord),
    UserOrganisation(UserOrganisationRecord),
    Organisation(OrganisationRecord),
    OrganisationMember(OrganisationMemberRecord),
    OrganisationService(OrganisationServiceRecord),
    /// A kind this version does not know, or no kind at all.
    Unknown { kind: Option<String>, key: Option<Key> },
}

impl Record {
    /// Decode by the `typ` attribute alone.
    ///
    /// Unrecognised kinds decode to [`Record::Unknown`]; a recognised kind
    /// with the wrong shape is an error.
    pub fn decode(item: &Item) -> Result<Self, DecodeError> {
        let raw_kind = item.get(KIND_ATTR).and_then(AttributeValue::as_s);
        let kind = match raw_kind.and_then(RecordKind::parse) {
            Some(kind) => kind,
            None => {
                return Ok(Record::Unknown {
                    kind: raw_kind.map(str::to_string),
                    key: Key::of_item(item),
                })
            }
        };
        Ok(match kind {
            RecordKind::User => Record::User(UserRecord::from_item(item)?),
            RecordKind::UserOrganisation => {
                Record::UserOrganisation(UserOrganisationRecord::from_item(item)?)
            }
            RecordKind::Organisation => Record::Organisation(OrganisationRecord::from_item(item)?),
            RecordKind::OrganisationMember => {
                Record::OrganisationMember(OrganisationMemberRecord::from_item(item)?)
            }
            RecordKind::OrganisationService => {
                Record::OrganisationService(OrganisationServiceRecord::from_item(item)?)
            }
        })
    }

    pub fn kind(&self) -> Option<RecordKind> {
        match self {
            Record::User(_) => Some(RecordKind::User),
            Record::UserOrganisation(_) => Some(RecordKind::UserOrganisation),
            Record::Organisation(_) => Some(RecordKind::Organisation),
            Record::OrganisationMember(_) => Some(RecordKind::OrganisationMember),
            Record::OrganisationService(_) => Some(RecordKind::OrganisationService),
            Record::Unknown { .. } => None,
        }
    }
}
