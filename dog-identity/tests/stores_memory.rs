use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use tokio_test::{assert_err, assert_ok};

use dog_identity::{
    backend::{
        memory::{MemoryTable, Operation},
        AttributeValue,
    },
    record::{organisation_member_key, organisation_service_key, user_organisation_key},
    FixedClock, GroupSet, IdentityConfig, IdentityError, Organisation, OrganisationStore,
    SequentialIds, Service, User, UserStore, GROUP_OWNER,
};

/// Test factory functions
fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
}

fn user(email: &str, first: &str) -> User {
    User::new(email, first, "Tester", "447900000000", now())
}

struct Fixture {
    table: MemoryTable,
    users: UserStore,
    organisations: OrganisationStore,
}

fn fixture_with(config: IdentityConfig) -> Fixture {
    let table = MemoryTable::new();
    let users = UserStore::new(table.clone(), config.clone()).with_clock(FixedClock(now()));
    let organisations = OrganisationStore::new(table.clone(), config)
        .with_clock(FixedClock(now()))
        .with_ids(SequentialIds::new("id"));
    Fixture {
        table,
        users,
        organisations,
    }
}

fn fixture() -> Fixture {
    fixture_with(IdentityConfig::new("identity"))
}

fn ids(users: &[User]) -> BTreeSet<String> {
    users.iter().map(|u| u.id.clone()).collect()
}

fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// S1. Creating An Organisation Seeds Its Owner
#[tokio::test]
async fn test_create_seeds_owner_group() {
    let f = fixture();
    let owner = user("owner@example.com", "Olive");
    f.users.put(&owner).await.unwrap();

    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();

    assert_eq!(
        f.organisations.get(&org_id).await.unwrap(),
        Organisation::new(org_id.clone(), "Acme")
    );
    let details = f.organisations.get_details(&org_id).await.unwrap();
    assert_eq!(ids(details.members_of(GROUP_OWNER)), set(&["owner@example.com"]));
    assert_eq!(details.members_of(GROUP_OWNER)[0], owner);
    assert!(details.services.is_empty());

    // The owner's side of the relationship is already accepted
    let user_details = f.users.get_details("owner@example.com").await.unwrap();
    assert_eq!(user_details.organisations, vec![Organisation::new(org_id, "Acme")]);
    assert!(user_details.invitations.is_empty());
}

/// S2. Organisation Groups Hold Exactly Their Members
#[tokio::test]
async fn test_hipsters_group() {
    let f = fixture();
    let u1 = user("u1@example.com", "One");
    let u2 = user("u2@example.com", "Two");
    let org_id = f.organisations.create(&u1, "Cafe").await.unwrap();

    f.organisations
        .add_user_to_organisation_groups(&org_id, &u2, ["hipsters"])
        .await
        .unwrap();

    let details = f.organisations.get_details(&org_id).await.unwrap();
    assert_eq!(ids(details.members_of("hipsters")), set(&["u2@example.com"]));
    assert_eq!(ids(details.members_of(GROUP_OWNER)), set(&["u1@example.com"]));
}

/// S3. Service Rename And Group Revocation
#[tokio::test]
async fn test_service_rename_and_group_revocation() {
    let f = fixture();
    let u1 = user("u1@example.com", "One");
    let org_id = f.organisations.create(&u1, "Acme").await.unwrap();

    let service_id = f
        .organisations
        .create_service(&org_id, "Billing")
        .await
        .unwrap();
    f.organisations
        .put_service(&org_id, &Service::new(service_id.clone(), "Invoicing"))
        .await
        .unwrap();
    f.organisations
        .add_user_to_service_groups(&org_id, &u1, &service_id, ["g1", "g2"])
        .await
        .unwrap();
    f.organisations
        .remove_user_from_service_groups(&org_id, &u1.id, &service_id, ["g2"])
        .await
        .unwrap();

    let details = f.organisations.get_details(&org_id).await.unwrap();
    assert_eq!(details.services.len(), 1);
    let service = &details.services[0];
    assert_eq!(service.id, service_id);
    assert_eq!(service.name, "Invoicing");
    assert_eq!(ids(service.members_of("g1")), set(&["u1@example.com"]));
    assert!(!service.groups.contains_key("g2"));

    // Organisation groups survive service grants
    assert_eq!(ids(details.members_of(GROUP_OWNER)), set(&["u1@example.com"]));
}

/// S4. Deleting A Service Does Not Touch Member Records
#[tokio::test]
async fn test_delete_service_is_not_cascading() {
    let f = fixture();
    let u1 = user("u1@example.com", "One");
    let org_id = f.organisations.create(&u1, "Acme").await.unwrap();
    let service_id = f
        .organisations
        .create_service(&org_id, "Billing")
        .await
        .unwrap();
    f.organisations
        .add_user_to_service_groups(&org_id, &u1, &service_id, ["admin"])
        .await
        .unwrap();

    f.organisations
        .delete_service(&org_id, &service_id)
        .await
        .unwrap();

    let details = f.organisations.get_details(&org_id).await.unwrap();
    assert!(details.services.is_empty());
    assert!(f
        .table
        .item(&organisation_service_key(&org_id, &service_id))
        .is_none());

    let member = f
        .table
        .item(&organisation_member_key(&org_id, "u1@example.com"))
        .unwrap();
    let tag = format!("serviceGroup/{}/admin", service_id);
    match &member["groups"] {
        AttributeValue::Ss(tags) => assert!(tags.contains(&tag)),
        other => panic!("unexpected groups attribute {:?}", other),
    }
}

/// S5. Invitation Lifecycle
#[tokio::test]
async fn test_invite_then_accept() {
    let f = fixture();
    let owner = user("owner@example.com", "Olive");
    let guest = user("guest@example.com", "Gus");
    f.users.put(&guest).await.unwrap();
    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();
    let org = f.organisations.get(&org_id).await.unwrap();

    f.users
        .invite(&guest, &org, &GroupSet::new().with_organisation_groups(["g"]))
        .await
        .unwrap();

    let pending = f.users.get_details(&guest.id).await.unwrap();
    assert!(pending.organisations.is_empty());
    assert_eq!(pending.invitations.len(), 1);
    assert_eq!(pending.invitations[0].organisation, org);
    assert_eq!(pending.invitations[0].invited_at, now());
    assert!(pending.invitations[0].accepted_at.is_none());

    assert_ok!(f.users.accept_invite(&guest.id, &org_id).await);

    let accepted = f.users.get_details(&guest.id).await.unwrap();
    assert_eq!(accepted.organisations, vec![org]);
    assert!(accepted.invitations.is_empty());

    let details = f.organisations.get_details(&org_id).await.unwrap();
    assert_eq!(ids(details.members_of("g")), set(&["guest@example.com"]));
}

/// S6. Rejecting An Invitation Removes Both Sides
#[tokio::test]
async fn test_reject_removes_all_trace() {
    let f = fixture();
    let owner = user("owner@example.com", "Olive");
    let guest = user("guest@example.com", "Gus");
    f.users.put(&guest).await.unwrap();
    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();
    let org = f.organisations.get(&org_id).await.unwrap();
    f.users
        .invite(&guest, &org, &GroupSet::new().with_organisation_groups(["g"]))
        .await
        .unwrap();

    assert_ok!(f.users.reject_invite(&guest.id, &org_id).await);
    assert_err!(f.users.accept_invite(&guest.id, &org_id).await);

    let details = f.users.get_details(&guest.id).await.unwrap();
    assert!(details.organisations.is_empty());
    assert!(details.invitations.is_empty());
    assert!(f
        .table
        .item(&organisation_member_key(&org_id, &guest.id))
        .is_none());
    assert!(f
        .table
        .item(&user_organisation_key(&guest.id, &org_id))
        .is_none());

    let org_details = f.organisations.get_details(&org_id).await.unwrap();
    assert!(org_details.members_of("g").is_empty());
}

/// S7. Base Records Alone Project To Empty Collections
#[tokio::test]
async fn test_base_records_alone_give_empty_collections() {
    let f = fixture();
    f.organisations
        .put(&Organisation::new("bare", "Bare Org"))
        .await
        .unwrap();
    f.users.put(&user("solo@example.com", "Solo")).await.unwrap();

    let org = f.organisations.get_details("bare").await.unwrap();
    assert!(org.groups.is_empty());
    assert!(org.services.is_empty());

    let json = serde_json::to_value(&org).unwrap();
    assert!(json["groups"].is_object());
    assert!(json["services"].is_array());

    let solo = f.users.get_details("solo@example.com").await.unwrap();
    assert!(solo.organisations.is_empty());
    assert!(solo.invitations.is_empty());
}

/// S8. Reads Of Absent Entities
#[tokio::test]
async fn test_absent_entities_are_not_found() {
    let f = fixture();
    assert!(f.users.get("ghost@example.com").await.unwrap_err().is_not_found());
    assert!(f
        .users
        .get_details("ghost@example.com")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(f.organisations.get("nope").await.unwrap_err().is_not_found());
    assert!(f
        .organisations
        .get_details("nope")
        .await
        .unwrap_err()
        .is_not_found());
}

/// S9. Pagination Is Followed To The End
#[tokio::test]
async fn test_small_pages_return_every_member() {
    let f = fixture_with(IdentityConfig::new("identity").with_page_size(2));
    let owner = user("owner@example.com", "Olive");
    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();
    let mut expected = BTreeSet::new();
    for i in 0..9 {
        let member = user(&format!("m{}@example.com", i), "Member");
        expected.insert(member.id.clone());
        f.organisations
            .add_user_to_organisation_groups(&org_id, &member, ["member"])
            .await
            .unwrap();
    }

    let details = f.organisations.get_details(&org_id).await.unwrap();
    assert_eq!(ids(details.members_of("member")), expected);
    assert_eq!(ids(details.members_of(GROUP_OWNER)), set(&["owner@example.com"]));
}

/// S10. A Failed Page Fails The Read
#[tokio::test]
async fn test_failed_page_is_an_error_not_a_partial_result() {
    let f = fixture_with(IdentityConfig::new("identity").with_page_size(2));
    let owner = user("owner@example.com", "Olive");
    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();
    for i in 0..5 {
        f.organisations
            .add_user_to_organisation_groups(&org_id, &user(&format!("m{}@example.com", i), "M"), ["member"])
            .await
            .unwrap();
    }

    f.table.fail_after(Operation::Query, 1);
    let err = f.organisations.get_details(&org_id).await.unwrap_err();
    match err {
        IdentityError::StoreUnavailable { operation, key, .. } => {
            assert_eq!(operation, "organisationStore.getDetails");
            assert_eq!(key, format!("organisation/{}", org_id));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

/// S11. Unknown Record Kinds Are Skipped
#[tokio::test]
async fn test_unknown_record_kinds_are_skipped() {
    let f = fixture();
    let owner = user("owner@example.com", "Olive");
    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();

    let mut foreign = dog_identity::backend::Key::new(
        format!("organisation/{}", org_id),
        "organisationInvoice/2020-01",
    )
    .to_item();
    foreign.insert("typ".into(), AttributeValue::string("organisationInvoice"));
    foreign.insert("v".into(), AttributeValue::number(3));
    f.table.insert_raw(foreign);

    let details = f.organisations.get_details(&org_id).await.unwrap();
    assert_eq!(ids(details.members_of(GROUP_OWNER)), set(&["owner@example.com"]));
}

/// S12. Malformed Records Fail The Read
#[tokio::test]
async fn test_malformed_record_is_a_decode_error() {
    let f = fixture();
    let owner = user("owner@example.com", "Olive");
    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();

    let key = organisation_member_key(&org_id, "owner@example.com");
    let mut member = f.table.item(&key).unwrap();
    member.remove("firstName");
    f.table.insert_raw(member);

    let err = f.organisations.get_details(&org_id).await.unwrap_err();
    assert!(matches!(err, IdentityError::Decode { .. }));
    assert_eq!(err.kind().status_code(), 500);
}

/// S13. Removing A User Deletes Only The Member Record
#[tokio::test]
async fn test_remove_user_keeps_relationship_record() {
    let f = fixture();
    let owner = user("owner@example.com", "Olive");
    let u2 = user("u2@example.com", "Two");
    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();
    let org = f.organisations.get(&org_id).await.unwrap();
    f.users.invite(&u2, &org, &GroupSet::new()).await.unwrap();

    assert_ok!(f.organisations.remove_user(&org_id, &u2.id).await);

    assert!(f
        .table
        .item(&organisation_member_key(&org_id, &u2.id))
        .is_none());
    assert!(f
        .table
        .item(&user_organisation_key(&u2.id, &org_id))
        .is_some());
}

/// S14. Grants Refresh The Member's Profile Copy
#[tokio::test]
async fn test_grants_refresh_profile() {
    let f = fixture();
    let owner = user("owner@example.com", "Olive");
    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();

    let mut renamed = owner.clone();
    renamed.first_name = "Olivia".into();
    f.organisations
        .add_user_to_organisation_groups(&org_id, &renamed, ["admins"])
        .await
        .unwrap();

    let details = f.organisations.get_details(&org_id).await.unwrap();
    assert_eq!(details.members_of("admins")[0].first_name, "Olivia");
    assert_eq!(details.members_of(GROUP_OWNER)[0].first_name, "Olivia");
}

/// S15. Combined Grants And Revocations
#[tokio::test]
async fn test_combined_group_set_grant_and_revoke() {
    let f = fixture();
    let owner = user("owner@example.com", "Olive");
    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();
    let service_id = f.organisations.create_service(&org_id, "Search").await.unwrap();

    let grant = GroupSet::new()
        .with_organisation_groups(["editors"])
        .with_service_groups(service_id.clone(), ["readers", "writers"]);
    f.organisations
        .add_user_to_groups(&org_id, &owner, &grant)
        .await
        .unwrap();

    let revoke = GroupSet::new()
        .with_organisation_groups([GROUP_OWNER])
        .with_service_groups(service_id.clone(), ["writers"]);
    f.organisations
        .remove_user_from_groups(&org_id, &owner.id, &revoke)
        .await
        .unwrap();

    let details = f.organisations.get_details(&org_id).await.unwrap();
    assert!(details.members_of(GROUP_OWNER).is_empty());
    assert_eq!(ids(details.members_of("editors")), set(&["owner@example.com"]));
    let service = details.service(&service_id).unwrap();
    assert_eq!(ids(service.members_of("readers")), set(&["owner@example.com"]));
    assert!(service.members_of("writers").is_empty());
}

/// S16. Inviting An Existing Member Keeps Their Groups
#[tokio::test]
async fn test_invite_merges_into_existing_member() {
    let f = fixture();
    let owner = user("owner@example.com", "Olive");
    let u2 = user("u2@example.com", "Two");
    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();
    let org = f.organisations.get(&org_id).await.unwrap();

    // Granted directly, so there is no relationship record yet
    f.organisations
        .add_user_to_organisation_groups(&org_id, &u2, ["admins"])
        .await
        .unwrap();
    assert_ok!(
        f.users
            .invite(&u2, &org, &GroupSet::new().with_organisation_groups(["g"]))
            .await
    );

    let details = f.organisations.get_details(&org_id).await.unwrap();
    assert_eq!(ids(details.members_of("admins")), set(&["u2@example.com"]));
    assert_eq!(ids(details.members_of("g")), set(&["u2@example.com"]));

    let member = f
        .table
        .item(&organisation_member_key(&org_id, "u2@example.com"))
        .unwrap();
    assert_eq!(
        member["groups"],
        AttributeValue::string_set(["organisationGroup/admins", "organisationGroup/g"])
    );
}

/// S17. A Failed Re-Invite Leaves The Member Untouched
#[tokio::test]
async fn test_reinvite_does_not_touch_member() {
    let f = fixture();
    let owner = user("owner@example.com", "Olive");
    let u2 = user("u2@example.com", "Two");
    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();
    let org = f.organisations.get(&org_id).await.unwrap();
    f.users
        .invite(&u2, &org, &GroupSet::new().with_organisation_groups(["g"]))
        .await
        .unwrap();

    let err = f
        .users
        .invite(&u2, &org, &GroupSet::new().with_organisation_groups(["other"]))
        .await
        .unwrap_err();

    assert!(err.is_already_exists());
    let details = f.organisations.get_details(&org_id).await.unwrap();
    assert_eq!(ids(details.members_of("g")), set(&["u2@example.com"]));
    assert!(details.members_of("other").is_empty());
}

/// S18. Service IDs Containing A Slash Are Rejected
#[tokio::test]
async fn test_service_id_with_slash_is_invalid() {
    let f = fixture();
    let owner = user("owner@example.com", "Olive");
    let org_id = f.organisations.create(&owner, "Acme").await.unwrap();

    let err = f
        .organisations
        .put_service(&org_id, &Service::new("billing/eu", "Billing EU"))
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::Invalid { .. }));

    let err = f
        .organisations
        .add_user_to_service_groups(&org_id, &owner, "billing/eu", ["admin"])
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::Invalid { .. }));

    let err = f
        .organisations
        .remove_user_from_service_groups(&org_id, &owner.id, "billing/eu", ["admin"])
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::Invalid { .. }));

    let grant = GroupSet::new().with_service_groups("billing/eu", ["admin"]);
    assert!(matches!(
        f.organisations.add_user_to_groups(&org_id, &owner, &grant).await,
        Err(IdentityError::Invalid { .. })
    ));
    let org = f.organisations.get(&org_id).await.unwrap();
    assert!(matches!(
        f.users.invite(&user("u2@example.com", "Two"), &org, &grant).await,
        Err(IdentityError::Invalid { .. })
    ));

    // Nothing was written past the organisation's own three records
    assert_eq!(f.table.len(), 3);
}
