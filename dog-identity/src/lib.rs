//! # dog-identity: Multi-tenant identity storage for DogRS
//!
//! `dog-identity` keeps users, organisations, services and group memberships
//! in a single key-value table and rebuilds rich views of them from one
//! partition read.
//!
//! ## Key Features
//!
//! - **Single-table layout**: every record of an organisation shares the
//!   `organisation/<id>` partition, every record of a user the `user/<email>` partition
//! - **Commutative group grants**: membership tags are merged into a string set,
//!   so concurrent grants never overwrite each other
//! - **Atomic lifecycles**: creating an organisation or an invitation writes all
//!   of its records in one transaction
//! - **Forward compatible reads**: records of unknown kinds are skipped
//! - **Pluggable storage**: an in-memory table for tests, DynamoDB behind the
//!   `dynamodb` feature
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_identity::prelude::*;
//! use dog_identity::backend::memory::MemoryTable;
//!
//! # #[tokio::main]
//! # async fn main() -> IdentityResult<()> {
//! let table = MemoryTable::new();
//! let config = IdentityConfig::new("identity");
//! let users = UserStore::new(table.clone(), config.clone());
//! let organisations = OrganisationStore::new(table, config);
//!
//! let owner = User::new("sarah@example.com", "Sarah", "Connor", "447901234567", chrono::Utc::now());
//! users.put(&owner).await?;
//! let org_id = organisations.create(&owner, "Resistance").await?;
//!
//! let details = organisations.get_details(&org_id).await?;
//! assert_eq!(details.members_of(GROUP_OWNER).len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ UserStore / OrganisationStore    │  ← operations
//! ├──────────────────────────────────┤
//! │ record · groupset · projection   │  ← codecs and joins, no I/O
//! ├──────────────────────────────────┤
//! │ Table                            │  ← paging, deadlines, error context
//! ├──────────────────────────────────┤
//! │ TableBackend                     │  ← MemoryTable, DynamoDbTable
//! └──────────────────────────────────┘
//! ```

pub mod backend;
mod clock;
mod config;
mod error;
pub mod groupset;
mod organisation_store;
pub mod projection;
pub mod record;
pub mod table;
mod types;
mod user_store;

// Re-export main types for clean API
pub use backend::{BackendError, BackendResult, TableBackend};
pub use clock::{Clock, FixedClock, IdGenerator, SequentialIds, SystemClock, UuidGenerator};
pub use config::{IdentityConfig, ENV_PREFIX};
pub use error::{DecodeError, ErrorKind, IdentityError, IdentityResult};
pub use groupset::{GroupSet, GroupSetError};
pub use organisation_store::OrganisationStore;
pub use table::Table;
pub use types::{
    normalize_email, GroupName, Invitation, Organisation, OrganisationDetails, Service, User,
    UserDetails, GROUP_MEMBER, GROUP_OWNER,
};
pub use user_store::UserStore;

#[cfg(feature = "memory")]
pub use backend::memory::MemoryTable;

#[cfg(feature = "dynamodb")]
pub use backend::dynamodb::DynamoDbTable;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        GroupName, GroupSet, IdentityConfig, IdentityError, IdentityResult, Organisation,
        OrganisationDetails, OrganisationStore, Service, TableBackend, User, UserDetails,
        UserStore, GROUP_MEMBER, GROUP_OWNER,
    };
}
