use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::backend::{Condition, TableBackend, TransactWrite};
use crate::clock::{Clock, SystemClock};
use crate::config::IdentityConfig;
use crate::groupset::GroupSet;
use crate::projection::build_user_details;
use crate::record::{
    field, organisation_member_key, user_key, user_organisation_key, user_partition,
    OrganisationMemberRecord, UserOrganisationRecord, UserRecord,
};
use crate::table::Table;
use crate::types::{normalize_email, Organisation, User, UserDetails};
use crate::{IdentityError, IdentityResult};

pub(crate) fn require<'a>(what: &str, value: &'a str) -> IdentityResult<&'a str> {
    if value.trim().is_empty() {
        return Err(IdentityError::invalid(format!("{} must not be empty", what)));
    }
    Ok(value)
}

/// Service IDs end at the first `/` of a `serviceGroup` tag, so they must not
/// contain one.
pub(crate) fn require_service_id(service_id: &str) -> IdentityResult<&str> {
    require("service id", service_id)?;
    if service_id.contains('/') {
        return Err(IdentityError::invalid(format!(
            "service id {:?} must not contain '/'",
            service_id
        )));
    }
    Ok(service_id)
}

pub(crate) fn require_group_set(groups: &GroupSet) -> IdentityResult<()> {
    for service_id in groups.service_groups().keys() {
        require_service_id(service_id)?;
    }
    Ok(())
}

/// Users and their side of organisation relationships.
#[derive(Clone)]
pub struct UserStore {
    table: Table,
    clock: Arc<dyn Clock>,
}

impl UserStore {
    pub fn new<B: TableBackend + 'static>(backend: B, config: IdentityConfig) -> Self {
        Self::with_table(Table::new(backend, config))
    }

    pub fn with_table(table: Table) -> Self {
        Self {
            table,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for invitation timestamps
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Create or replace a user.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn put(&self, user: &User) -> IdentityResult<()> {
        require("user id", &user.id)?;
        let user = User {
            id: normalize_email(&user.id),
            ..user.clone()
        };
        self.table
            .put("userStore.put", UserRecord::new(user).to_item(), None)
            .await
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> IdentityResult<User> {
        const OP: &str = "userStore.get";
        let id = normalize_email(require("user id", id)?);
        let key = user_key(&id);
        let item = self
            .table
            .get(OP, &key)
            .await?
            .ok_or_else(|| IdentityError::not_found(OP, key.to_string()))?;
        UserRecord::from_item(&item)
            .map(|record| record.user)
            .map_err(|e| IdentityError::decode(OP, e))
    }

    /// The user with their accepted organisations and pending invitations.
    #[instrument(skip(self))]
    pub async fn get_details(&self, id: &str) -> IdentityResult<UserDetails> {
        const OP: &str = "userStore.getDetails";
        let id = normalize_email(require("user id", id)?);
        let partition = user_partition(&id);
        let items = self.table.query_partition(OP, &partition).await?;
        if items.is_empty() {
            return Err(IdentityError::not_found(OP, partition));
        }
        let details =
            build_user_details(&partition, &items).map_err(|e| IdentityError::decode(OP, e))?;
        debug!(
            organisations = details.organisations.len(),
            invitations = details.invitations.len(),
            "loaded user details"
        );
        Ok(details)
    }

    /// Invite `user` into `organisation` with the given groups.
    ///
    /// Writes the member record and the user's pending relationship record in
    /// one transaction. The groups are merged into the member record, so
    /// earlier grants survive. Fails with `AlreadyExists` when the user
    /// already has a relationship with the organisation.
    #[instrument(skip(self, user, organisation, groups), fields(user_id = %user.id, organisation_id = %organisation.id))]
    pub async fn invite(
        &self,
        user: &User,
        organisation: &Organisation,
        groups: &GroupSet,
    ) -> IdentityResult<()> {
        require("user id", &user.id)?;
        require("organisation id", &organisation.id)?;
        require_group_set(groups)?;
        let user = User {
            id: normalize_email(&user.id),
            ..user.clone()
        };
        // Merged into any member record granted before the invitation.
        let member = OrganisationMemberRecord::profile_upsert(&organisation.id, &user)
            .add_to_set(field::GROUPS, groups.encode());
        let relationship = UserOrganisationRecord {
            email: user.id.clone(),
            organisation: organisation.clone(),
            invited_at: self.clock.now(),
            accepted_at: None,
        };

        self.table
            .transact(
                "userStore.invite",
                vec![
                    TransactWrite::update(
                        organisation_member_key(&organisation.id, &user.id),
                        member,
                    ),
                    TransactWrite::put_if_absent(relationship.to_item()),
                ],
            )
            .await?;
        info!("invited user");
        Ok(())
    }

    /// Mark the invitation accepted. The member record is left untouched.
    #[instrument(skip(self))]
    pub async fn accept_invite(&self, user_id: &str, organisation_id: &str) -> IdentityResult<()> {
        let user_id = normalize_email(require("user id", user_id)?);
        require("organisation id", organisation_id)?;
        let update =
            UserOrganisationRecord::accept(&self.clock.now()).with_condition(Condition::Exists);
        self.table
            .update(
                "userStore.acceptInvite",
                &user_organisation_key(&user_id, organisation_id),
                update,
            )
            .await?;
        info!("accepted invitation");
        Ok(())
    }

    /// Remove both sides of the relationship in one transaction.
    #[instrument(skip(self))]
    pub async fn reject_invite(&self, user_id: &str, organisation_id: &str) -> IdentityResult<()> {
        let user_id = normalize_email(require("user id", user_id)?);
        require("organisation id", organisation_id)?;
        self.table
            .transact(
                "userStore.rejectInvite",
                vec![
                    TransactWrite::delete(organisation_member_key(organisation_id, &user_id)),
                    TransactWrite::delete(user_organisation_key(&user_id, organisation_id)),
                ],
            )
            .await?;
        info!("rejected invitation");
        Ok(())
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryTable;
    use crate::backend::AttributeValue;
    use crate::clock::FixedClock;
    use chrono::{TimeZone, Utc};

    fn store(memory: &MemoryTable) -> UserStore {
        let at = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        UserStore::new(memory.clone(), IdentityConfig::new("identity")).with_clock(FixedClock(at))
    }

    fn user() -> User {
        let at = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        User::new("Kyle@Example.com", "Kyle", "Reese", "0123", at)
    }

    #[tokio::test]
    async fn get_lowercases_the_lookup() {
        let memory = MemoryTable::new();
        let users = store(&memory);
        users.put(&user()).await.unwrap();
        let got = users.get("KYLE@example.com").await.unwrap();
        assert_eq!(got, user());
    }

    #[tokio::test]
    async fn get_of_absent_user_is_not_found() {
        let users = store(&MemoryTable::new());
        let err = users.get("nobody@example.com").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "userStore.get: record not found: user/nobody@example.com|user"
        );
    }

    #[tokio::test]
    async fn empty_id_is_invalid() {
        let users = store(&MemoryTable::new());
        assert!(matches!(
            users.get("  ").await,
            Err(IdentityError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn invite_uses_the_injected_clock() {
        let memory = MemoryTable::new();
        let users = store(&memory);
        let org = Organisation::new("o1", "Cyberdyne");
        users.invite(&user(), &org, &GroupSet::new()).await.unwrap();

        let stored = memory
            .item(&user_organisation_key("kyle@example.com", "o1"))
            .unwrap();
        assert_eq!(stored["invitedAt"], AttributeValue::string("2021-03-04T05:06:07Z"));
        assert_eq!(stored["acceptedAt"], AttributeValue::Null);
    }

    #[tokio::test]
    async fn reinvite_is_rejected() {
        let memory = MemoryTable::new();
        let users = store(&memory);
        let org = Organisation::new("o1", "Cyberdyne");
        users.invite(&user(), &org, &GroupSet::new()).await.unwrap();
        let err = users
            .invite(&user(), &org, &GroupSet::new())
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn accepting_a_missing_invitation_is_not_found() {
        let memory = MemoryTable::new();
        let users = store(&memory);
        let err = users
            .accept_invite("kyle@example.com", "o1")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(memory.is_empty());
    }
}
