//! Rebuilds domain objects from the complete contents of one partition.
//!
//! Both builders run in two passes. The first decodes and classifies every
//! item by kind; the second resolves cross references. Item order inside the
//! partition therefore never changes the result, apart from the order of
//! users within a group.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::backend::Item;
use crate::error::DecodeError;
use crate::record::{
    OrganisationMemberRecord, OrganisationServiceRecord, Record, RecordKind,
    UserOrganisationRecord,
};
use crate::types::{
    GroupName, Invitation, Organisation, OrganisationDetails, Service, User, UserDetails,
};

fn skip(partition: &str, record: &Record) {
    match record {
        Record::Unknown { kind, key } => debug!(
            partition,
            kind = kind.as_deref().unwrap_or("<none>"),
            key = ?key,
            "skipping record of unknown kind"
        ),
        other => debug!(
            partition,
            kind = ?other.kind(),
            "skipping record that does not belong in this partition"
        ),
    }
}

/// Project a `user/<email>` partition.
///
/// Accepted relationships become `organisations`, pending ones
/// `invitations`. Fails when the `user` record is absent or any recognised
/// record is malformed.
pub fn build_user_details(partition: &str, items: &[Item]) -> Result<UserDetails, DecodeError> {
    let mut user: Option<User> = None;
    let mut relationships: Vec<UserOrganisationRecord> = Vec::new();

    for item in items {
        match Record::decode(item)? {
            Record::User(record) => user = Some(record.user),
            Record::UserOrganisation(record) => relationships.push(record),
            other => skip(partition, &other),
        }
    }

    let user = user.ok_or_else(|| DecodeError::MissingRecord {
        kind: RecordKind::User.as_str(),
        partition: partition.to_string(),
    })?;

    let mut details = UserDetails {
        user,
        organisations: Vec::new(),
        invitations: Vec::new(),
    };
    for relationship in relationships {
        match relationship.accepted_at {
            Some(_) => details.organisations.push(relationship.organisation),
            None => details.invitations.push(Invitation {
                organisation: relationship.organisation,
                invited_at: relationship.invited_at,
                accepted_at: None,
            }),
        }
    }
    Ok(details)
}

/// Project an `organisation/<orgID>` partition.
///
/// Service-group memberships are attached once every record has been read.
/// Memberships naming a service that has no service record are dropped, with
/// a warning per service.
pub fn build_organisation_details(
    partition: &str,
    items: &[Item],
) -> Result<OrganisationDetails, DecodeError> {
    let mut organisation: Option<Organisation> = None;
    let mut members: Vec<OrganisationMemberRecord> = Vec::new();
    let mut service_records: Vec<OrganisationServiceRecord> = Vec::new();

    for item in items {
        match Record::decode(item)? {
            Record::Organisation(record) => organisation = Some(record.organisation),
            Record::OrganisationMember(record) => members.push(record),
            Record::OrganisationService(record) => service_records.push(record),
            other => skip(partition, &other),
        }
    }

    let organisation = organisation.ok_or_else(|| DecodeError::MissingRecord {
        kind: RecordKind::Organisation.as_str(),
        partition: partition.to_string(),
    })?;

    let mut services: Vec<Service> = Vec::with_capacity(service_records.len());
    let mut service_index: HashMap<String, usize> = HashMap::new();
    for record in service_records {
        match service_index.get(&record.service_id) {
            Some(&i) => services[i].name = record.service_name,
            None => {
                service_index.insert(record.service_id.clone(), services.len());
                services.push(Service::new(record.service_id, record.service_name));
            }
        }
    }

    let mut groups: BTreeMap<GroupName, Vec<User>> = BTreeMap::new();
    let mut unregistered: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for member in members {
        for group in member.groups.organisation_groups() {
            groups
                .entry(group.clone())
                .or_default()
                .push(member.user.clone());
        }
        for (service_id, names) in member.groups.service_groups() {
            let Some(&i) = service_index.get(service_id) else {
                unregistered
                    .entry(service_id.clone())
                    .or_default()
                    .insert(member.user.id.clone());
                continue;
            };
            for group in names {
                services[i]
                    .groups
                    .entry(group.clone())
                    .or_default()
                    .push(member.user.clone());
            }
        }
    }

    for (service_id, users) in unregistered {
        warn!(
            organisation_id = %organisation.id,
            service_id = %service_id,
            members = users.len(),
            "dropping group memberships of unregistered service"
        );
    }

    Ok(OrganisationDetails {
        organisation,
        groups,
        services,
    })
}
