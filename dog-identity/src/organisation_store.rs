use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::backend::{Condition, TableBackend, TransactWrite, UpdateSpec};
use crate::clock::{Clock, IdGenerator, SystemClock, UuidGenerator};
use crate::config::IdentityConfig;
use crate::groupset::GroupSet;
use crate::projection::build_organisation_details;
use crate::record::{
    field, organisation_key, organisation_member_key, organisation_partition,
    organisation_service_key, OrganisationMemberRecord, OrganisationRecord,
    OrganisationServiceRecord, UserOrganisationRecord,
};
use crate::table::Table;
use crate::types::{normalize_email, GroupName, Organisation, OrganisationDetails, Service, User};
use crate::user_store::{require, require_group_set, require_service_id};
use crate::{IdentityError, IdentityResult};

/// Organisations, their services and their members' group assignments.
#[derive(Clone)]
pub struct OrganisationStore {
    table: Table,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl OrganisationStore {
    pub fn new<B: TableBackend + 'static>(backend: B, config: IdentityConfig) -> Self {
        Self::with_table(Table::new(backend, config))
    }

    pub fn with_table(table: Table) -> Self {
        Self {
            table,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
        }
    }

    /// Use `clock` for membership timestamps
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Use `ids` for new organisation and service IDs
    pub fn with_ids<G: IdGenerator + 'static>(mut self, ids: G) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Create an organisation owned by `owner` and return its ID.
    ///
    /// The organisation record, the owner's member record (in the `owner`
    /// group) and the owner's accepted relationship record are written in one
    /// transaction. An ID collision fails with `AlreadyExists`.
    #[instrument(skip(self, owner), fields(owner_id = %owner.id))]
    pub async fn create(&self, owner: &User, name: &str) -> IdentityResult<String> {
        require("owner id", &owner.id)?;
        let owner = User {
            id: normalize_email(&owner.id),
            ..owner.clone()
        };
        let organisation = Organisation::new(self.ids.generate(), name);
        let now = self.clock.now();

        let member = OrganisationMemberRecord {
            organisation_id: organisation.id.clone(),
            user: owner.clone(),
            groups: GroupSet::new().with_organisation_groups([GroupName::owner()]),
        };
        let relationship = UserOrganisationRecord {
            email: owner.id.clone(),
            organisation: organisation.clone(),
            invited_at: now,
            accepted_at: Some(now),
        };

        self.table
            .transact(
                "organisationStore.create",
                vec![
                    TransactWrite::put_if_absent(
                        OrganisationRecord::new(organisation.clone()).to_item(),
                    ),
                    TransactWrite::put(member.to_item()),
                    TransactWrite::put(relationship.to_item()),
                ],
            )
            .await?;
        info!(organisation_id = %organisation.id, "created organisation");
        Ok(organisation.id)
    }

    /// Create or rename an organisation.
    #[instrument(skip(self, organisation), fields(organisation_id = %organisation.id))]
    pub async fn put(&self, organisation: &Organisation) -> IdentityResult<()> {
        require("organisation id", &organisation.id)?;
        self.table
            .put(
                "organisationStore.put",
                OrganisationRecord::new(organisation.clone()).to_item(),
                None,
            )
            .await
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> IdentityResult<Organisation> {
        const OP: &str = "organisationStore.get";
        let key = organisation_key(require("organisation id", id)?);
        let item = self
            .table
            .get(OP, &key)
            .await?
            .ok_or_else(|| IdentityError::not_found(OP, key.to_string()))?;
        OrganisationRecord::from_item(&item)
            .map(|record| record.organisation)
            .map_err(|e| IdentityError::decode(OP, e))
    }

    /// The organisation with its groups and services.
    #[instrument(skip(self))]
    pub async fn get_details(&self, id: &str) -> IdentityResult<OrganisationDetails> {
        const OP: &str = "organisationStore.getDetails";
        let partition = organisation_partition(require("organisation id", id)?);
        let items = self.table.query_partition(OP, &partition).await?;
        if items.is_empty() {
            return Err(IdentityError::not_found(OP, partition));
        }
        let details = build_organisation_details(&partition, &items)
            .map_err(|e| IdentityError::decode(OP, e))?;
        debug!(
            groups = details.groups.len(),
            services = details.services.len(),
            "loaded organisation details"
        );
        Ok(details)
    }

    /// Register a new service and return its ID.
    #[instrument(skip(self))]
    pub async fn create_service(&self, organisation_id: &str, name: &str) -> IdentityResult<String> {
        require("organisation id", organisation_id)?;
        let service_id = self.ids.generate();
        require_service_id(&service_id)?;
        let record = OrganisationServiceRecord {
            organisation_id: organisation_id.to_string(),
            service_id,
            service_name: name.to_string(),
        };
        self.table
            .put(
                "organisationStore.createService",
                record.to_item(),
                Some(Condition::NotExists),
            )
            .await?;
        info!(service_id = %record.service_id, "created service");
        Ok(record.service_id)
    }

    /// Create or rename a service. `service.groups` is ignored; memberships
    /// live on member records.
    #[instrument(skip(self, service), fields(service_id = %service.id))]
    pub async fn put_service(&self, organisation_id: &str, service: &Service) -> IdentityResult<()> {
        require("organisation id", organisation_id)?;
        require_service_id(&service.id)?;
        let record = OrganisationServiceRecord {
            organisation_id: organisation_id.to_string(),
            service_id: service.id.clone(),
            service_name: service.name.clone(),
        };
        self.table
            .put("organisationStore.putService", record.to_item(), None)
            .await
    }

    /// Delete the service record only. Member records keep their group tags
    /// for the service; projections drop them.
    #[instrument(skip(self))]
    pub async fn delete_service(&self, organisation_id: &str, service_id: &str) -> IdentityResult<()> {
        require("organisation id", organisation_id)?;
        require("service id", service_id)?;
        self.table
            .delete(
                "organisationStore.deleteService",
                &organisation_service_key(organisation_id, service_id),
                None,
            )
            .await?;
        info!("deleted service");
        Ok(())
    }

    pub async fn add_user_to_organisation_groups<I, G>(
        &self,
        organisation_id: &str,
        user: &User,
        groups: I,
    ) -> IdentityResult<()>
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupName>,
    {
        let groups = GroupSet::new().with_organisation_groups(groups);
        self.add_user_to_groups(organisation_id, user, &groups).await
    }

    pub async fn add_user_to_service_groups<I, G>(
        &self,
        organisation_id: &str,
        user: &User,
        service_id: &str,
        groups: I,
    ) -> IdentityResult<()>
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupName>,
    {
        require_service_id(service_id)?;
        let groups = GroupSet::new().with_service_groups(service_id, groups);
        self.add_user_to_groups(organisation_id, user, &groups).await
    }

    /// Grant `groups` to `user`, creating the member record if needed.
    ///
    /// The profile copy on the member record is refreshed. Tags are merged
    /// into the stored set, so concurrent grants do not overwrite each other.
    #[instrument(skip(self, user, groups), fields(user_id = %user.id))]
    pub async fn add_user_to_groups(
        &self,
        organisation_id: &str,
        user: &User,
        groups: &GroupSet,
    ) -> IdentityResult<()> {
        require("organisation id", organisation_id)?;
        require("user id", &user.id)?;
        require_group_set(groups)?;
        let user = User {
            id: normalize_email(&user.id),
            ..user.clone()
        };
        let update = OrganisationMemberRecord::profile_upsert(organisation_id, &user)
            .add_to_set(field::GROUPS, groups.encode());
        self.table
            .update(
                "organisationStore.addUserToGroups",
                &organisation_member_key(organisation_id, &user.id),
                update,
            )
            .await?;
        debug!("granted groups");
        Ok(())
    }

    pub async fn remove_user_from_organisation_groups<I, G>(
        &self,
        organisation_id: &str,
        user_id: &str,
        groups: I,
    ) -> IdentityResult<()>
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupName>,
    {
        let groups = GroupSet::new().with_organisation_groups(groups);
        self.remove_user_from_groups(organisation_id, user_id, &groups)
            .await
    }

    pub async fn remove_user_from_service_groups<I, G>(
        &self,
        organisation_id: &str,
        user_id: &str,
        service_id: &str,
        groups: I,
    ) -> IdentityResult<()>
    where
        I: IntoIterator<Item = G>,
        G: Into<GroupName>,
    {
        require_service_id(service_id)?;
        let groups = GroupSet::new().with_service_groups(service_id, groups);
        self.remove_user_from_groups(organisation_id, user_id, &groups)
            .await
    }

    /// Revoke `groups` from an existing member.
    ///
    /// A member left with no groups keeps its record; see
    /// [`OrganisationStore::remove_user`].
    #[instrument(skip(self, groups))]
    pub async fn remove_user_from_groups(
        &self,
        organisation_id: &str,
        user_id: &str,
        groups: &GroupSet,
    ) -> IdentityResult<()> {
        const OP: &str = "organisationStore.removeUserFromGroups";
        require("organisation id", organisation_id)?;
        require_group_set(groups)?;
        let user_id = normalize_email(require("user id", user_id)?);
        let key = organisation_member_key(organisation_id, &user_id);

        let update = UpdateSpec::new()
            .delete_from_set(field::GROUPS, groups.encode())
            .with_condition(Condition::Exists);
        if update.is_noop() {
            // Nothing to revoke; still report a missing member.
            return match self.table.get(OP, &key).await? {
                Some(_) => Ok(()),
                None => Err(IdentityError::not_found(OP, key.to_string())),
            };
        }
        self.table.update(OP, &key, update).await?;
        debug!("revoked groups");
        Ok(())
    }

    /// Delete the member record. The user's relationship record is left as is.
    #[instrument(skip(self))]
    pub async fn remove_user(&self, organisation_id: &str, user_id: &str) -> IdentityResult<()> {
        require("organisation id", organisation_id)?;
        let user_id = normalize_email(require("user id", user_id)?);
        self.table
            .delete(
                "organisationStore.removeUser",
                &organisation_member_key(organisation_id, &user_id),
                None,
            )
            .await?;
        info!("removed member");
        Ok(())
    }

    /// Refresh the names and phone number copied onto an existing member
    /// record. Groups are untouched.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn update_user_details(&self, organisation_id: &str, user: &User) -> IdentityResult<()> {
        require("organisation id", organisation_id)?;
        let user_id = normalize_email(require("user id", &user.id)?);
        self.table
            .update(
                "organisationStore.updateUserDetails",
                &organisation_member_key(organisation_id, &user_id),
                OrganisationMemberRecord::profile_update(user).with_condition(Condition::Exists),
            )
            .await
    }
}
