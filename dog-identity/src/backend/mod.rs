#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Partition key attribute name.
pub const PARTITION_KEY: &str = "id";
/// Sort key attribute name.
pub const SORT_KEY: &str = "rng";

/// One attribute value, restricted to the shapes the identity records use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    S(String),
    N(String),
    Ss(BTreeSet<String>),
    Null,
}

impl AttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self::S(value.into())
    }

    pub fn number(value: i64) -> Self {
        Self::N(value.to_string())
    }

    pub fn string_set<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Ss(values.into_iter().map(Into::into).collect())
    }

    pub fn as_s(&self) -> Option<&str> {
        match self {
            Self::S(s) => Some(s),
            _ => None,
        }
    }
}

/// A stored item: attribute name to value.
pub type Item = BTreeMap<String, AttributeValue>;

/// Primary key of an item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub partition: String,
    pub sort: String,
}

impl Key {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }

    /// Read the key attributes out of an item.
    pub fn of_item(item: &Item) -> Option<Self> {
        let partition = item.get(PARTITION_KEY)?.as_s()?;
        let sort = item.get(SORT_KEY)?.as_s()?;
        Some(Self::new(partition, sort))
    }

    /// The key as an item holding only the two key attributes.
    pub fn to_item(&self) -> Item {
        let mut item = Item::new();
        item.insert(PARTITION_KEY.to_string(), AttributeValue::string(&self.partition));
        item.insert(SORT_KEY.to_string(), AttributeValue::string(&self.sort));
        item
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.partition, self.sort)
    }
}

/// Precondition on the existence of the item being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The key must not be present yet.
    NotExists,
    /// The key must already be present.
    Exists,
}

/// Attribute-level update.
///
/// `add` and `delete` are set merges, never whole-value overwrites, so
/// concurrent updates touching different elements of the same set commute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSpec {
    pub set: BTreeMap<String, AttributeValue>,
    pub add: BTreeMap<String, BTreeSet<String>>,
    pub delete: BTreeMap<String, BTreeSet<String>>,
    pub condition: Option<Condition>,
}

impl UpdateSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.set.insert(name.into(), value);
        self
    }

    /// Merge `values` into the string set `name`. Empty input is dropped.
    pub fn add_to_set(mut self, name: impl Into<String>, values: BTreeSet<String>) -> Self {
        if !values.is_empty() {
            self.add.entry(name.into()).or_default().extend(values);
        }
        self
    }

    /// Remove `values` from the string set `name`. Empty input is dropped.
    pub fn delete_from_set(mut self, name: impl Into<String>, values: BTreeSet<String>) -> Self {
        if !values.is_empty() {
            self.delete.entry(name.into()).or_default().extend(values);
        }
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn is_noop(&self) -> bool {
        self.set.is_empty() && self.add.is_empty() && self.delete.is_empty()
    }
}

/// One constituent of an atomic multi-item write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactWrite {
    Put {
        item: Item,
        condition: Option<Condition>,
    },
    Delete {
        key: Key,
        condition: Option<Condition>,
    },
    Update {
        key: Key,
        update: UpdateSpec,
    },
}

impl TransactWrite {
    pub fn put(item: Item) -> Self {
        Self::Put {
            item,
            condition: None,
        }
    }

    pub fn put_if_absent(item: Item) -> Self {
        Self::Put {
            item,
            condition: Some(Condition::NotExists),
        }
    }

    pub fn delete(key: Key) -> Self {
        Self::Delete {
            key,
            condition: None,
        }
    }

    pub fn update(key: Key, update: UpdateSpec) -> Self {
        Self::Update { key, update }
    }

    pub fn key(&self) -> Option<Key> {
        match self {
            Self::Put { item, .. } => Key::of_item(item),
            Self::Delete { key, .. } | Self::Update { key, .. } => Some(key.clone()),
        }
    }
}

/// One page of a partition query.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub items: Vec<Item>,
    /// Present when more pages follow; pass it back as `exclusive_start`.
    pub last_evaluated_key: Option<Key>,
}

/// Errors reported by a table backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("condition check failed")]
    ConditionFailed,

    #[error("transaction canceled: {reason}")]
    TransactionCanceled {
        reason: String,
        /// True when at least one constituent failed its condition.
        condition_failed: bool,
    },

    #[error("backend unavailable: {source}")]
    Unavailable {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid backend request: {message}")]
    Invalid { message: String },
}

impl BackendError {
    /// Wrap any transport or service error
    pub fn unavailable<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Unavailable {
            source: Box::new(error),
        }
    }

    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// The key-value table the identity stores are written against.
///
/// Implementations must be safe for concurrent use; the stores add no
/// locking of their own.
#[async_trait]
pub trait TableBackend: Send + Sync {
    /// Point read by exact key.
    async fn get_item(&self, key: &Key, consistent: bool) -> BackendResult<Option<Item>>;

    /// Write a whole item, optionally guarded by a condition on its key.
    async fn put_item(&self, item: Item, condition: Option<Condition>) -> BackendResult<()>;

    /// Delete by exact key. Deleting an absent key succeeds unless conditioned.
    async fn delete_item(&self, key: &Key, condition: Option<Condition>) -> BackendResult<()>;

    /// Attribute-level upsert.
    async fn update_item(&self, key: &Key, update: UpdateSpec) -> BackendResult<()>;

    /// One page of the items sharing `partition`, ordered by sort key.
    async fn query_page(
        &self,
        partition: &str,
        exclusive_start: Option<Key>,
        limit: Option<u32>,
        consistent: bool,
    ) -> BackendResult<QueryPage>;

    /// All-or-nothing write across items, possibly in different partitions.
    async fn transact_write(&self, writes: Vec<TransactWrite>) -> BackendResult<()>;
}
