use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::backend::{
    AttributeValue, BackendError, BackendResult, Condition, Item, Key, QueryPage, TableBackend,
    TransactWrite, UpdateSpec, PARTITION_KEY, SORT_KEY,
};

/// Backend operations, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetItem,
    PutItem,
    DeleteItem,
    UpdateItem,
    Query,
    TransactWrite,
}

/// The error a `MemoryTable` reports for an injected fault.
#[derive(Error, Debug)]
#[error("injected fault on {0:?}")]
pub struct InjectedFault(pub Operation);

struct Fault {
    operation: Operation,
    remaining: usize,
}

/// In-memory table for testing and development.
///
/// Honours the same contract as the DynamoDB backend: conditions are checked
/// against the current item, set merges never overwrite the whole attribute,
/// and transactions are validated completely before anything is applied.
#[derive(Clone, Default)]
pub struct MemoryTable {
    items: Arc<RwLock<BTreeMap<Key, Item>>>,
    fault: Arc<Mutex<Option<Fault>>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `successful_calls` calls of `operation` through, then fail the next one.
    ///
    /// The fault is one-shot.
    pub fn fail_after(&self, operation: Operation, successful_calls: usize) {
        *self.fault.lock() = Some(Fault {
            operation,
            remaining: successful_calls,
        });
    }

    /// Store an item verbatim, bypassing every check. Test hook for
    /// seeding malformed or foreign records.
    pub fn insert_raw(&self, item: Item) {
        if let Some(key) = Key::of_item(&item) {
            self.items.write().insert(key, item);
        }
    }

    /// Current value of an item, if any.
    pub fn item(&self, key: &Key) -> Option<Item> {
        self.items.read().get(key).cloned()
    }

    /// Number of items in the table.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    fn check_fault(&self, operation: Operation) -> BackendResult<()> {
        let mut slot = self.fault.lock();
        if let Some(fault) = slot.as_mut() {
            if fault.operation == operation {
                if fault.remaining == 0 {
                    *slot = None;
                    return Err(BackendError::unavailable(InjectedFault(operation)));
                }
                fault.remaining -= 1;
            }
        }
        Ok(())
    }
}

fn condition_holds(items: &BTreeMap<Key, Item>, key: &Key, condition: Option<Condition>) -> bool {
    match condition {
        None => true,
        Some(Condition::NotExists) => !items.contains_key(key),
        Some(Condition::Exists) => items.contains_key(key),
    }
}

fn validate_update(existing: Option<&Item>, update: &UpdateSpec) -> BackendResult<()> {
    if update.is_noop() {
        return Err(BackendError::invalid("update has no clauses"));
    }
    let touched = update
        .set
        .keys()
        .chain(update.add.keys())
        .chain(update.delete.keys());
    for name in touched {
        if name == PARTITION_KEY || name == SORT_KEY {
            return Err(BackendError::invalid(format!(
                "update must not modify key attribute `{}`",
                name
            )));
        }
    }
    for name in update.add.keys().chain(update.delete.keys()) {
        if update.set.contains_key(name) {
            return Err(BackendError::invalid(format!(
                "attribute `{}` appears in more than one update clause",
                name
            )));
        }
        if let Some(current) = existing.and_then(|item| item.get(name)) {
            if !matches!(current, AttributeValue::Ss(_)) {
                return Err(BackendError::invalid(format!(
                    "set operation on non-set attribute `{}`",
                    name
                )));
            }
        }
    }
    Ok(())
}

fn apply_update(items: &mut BTreeMap<Key, Item>, key: &Key, update: &UpdateSpec) {
    let item = items.entry(key.clone()).or_insert_with(|| key.to_item());

    for (name, value) in &update.set {
        item.insert(name.clone(), value.clone());
    }

    for (name, values) in &update.add {
        match item.get_mut(name) {
            Some(AttributeValue::Ss(set)) => set.extend(values.iter().cloned()),
            _ => {
                item.insert(name.clone(), AttributeValue::Ss(values.clone()));
            }
        }
    }

    for (name, values) in &update.delete {
        let emptied = match item.get_mut(name) {
            Some(AttributeValue::Ss(set)) => {
                set.retain(|v| !values.contains(v));
                set.is_empty()
            }
            _ => false,
        };
        // An empty string set cannot be stored; the attribute goes away.
        if emptied {
            item.remove(name);
        }
    }
}

#[async_trait]
impl TableBackend for MemoryTable {
    async fn get_item(&self, key: &Key, _consistent: bool) -> BackendResult<Option<Item>> {
        self.check_fault(Operation::GetItem)?;
        Ok(self.items.read().get(key).cloned())
    }

    async fn put_item(&self, item: Item, condition: Option<Condition>) -> BackendResult<()> {
        self.check_fault(Operation::PutItem)?;
        let key = Key::of_item(&item)
            .ok_or_else(|| BackendError::invalid("item is missing its key attributes"))?;

        let mut items = self.items.write();
        if !condition_holds(&items, &key, condition) {
            return Err(BackendError::ConditionFailed);
        }
        items.insert(key, item);
        Ok(())
    }

    async fn delete_item(&self, key: &Key, condition: Option<Condition>) -> BackendResult<()> {
        self.check_fault(Operation::DeleteItem)?;
        let mut items = self.items.write();
        if !condition_holds(&items, key, condition) {
            return Err(BackendError::ConditionFailed);
        }
        items.remove(key);
        Ok(())
    }

    async fn update_item(&self, key: &Key, update: UpdateSpec) -> BackendResult<()> {
        self.check_fault(Operation::UpdateItem)?;
        let mut items = self.items.write();
        if !condition_holds(&items, key, update.condition) {
            return Err(BackendError::ConditionFailed);
        }
        validate_update(items.get(key), &update)?;
        apply_update(&mut items, key, &update);
        Ok(())
    }

    async fn query_page(
        &self,
        partition: &str,
        exclusive_start: Option<Key>,
        limit: Option<u32>,
        _consistent: bool,
    ) -> BackendResult<QueryPage> {
        self.check_fault(Operation::Query)?;
        let limit = limit.map(|l| l.max(1) as usize).unwrap_or(usize::MAX);

        let lower = match exclusive_start {
            Some(start) => Bound::Excluded(start),
            None => Bound::Included(Key::new(partition, "")),
        };
        let items = self.items.read();
        let mut matching = items
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.partition == partition);

        let mut page = QueryPage::default();
        let mut last = None;
        for (key, item) in matching.by_ref().take(limit) {
            page.items.push(item.clone());
            last = Some(key.clone());
        }
        if matching.next().is_some() {
            page.last_evaluated_key = last;
        }
        Ok(page)
    }

    async fn transact_write(&self, writes: Vec<TransactWrite>) -> BackendResult<()> {
        self.check_fault(Operation::TransactWrite)?;

        let mut seen = BTreeSet::new();
        for write in &writes {
            let key = write
                .key()
                .ok_or_else(|| BackendError::invalid("transaction item is missing its key"))?;
            if !seen.insert(key.clone()) {
                return Err(BackendError::invalid(format!(
                    "transaction touches {} more than once",
                    key
                )));
            }
        }

        let mut items = self.items.write();

        let mut failed = Vec::new();
        for (index, write) in writes.iter().enumerate() {
            let (key, condition) = match write {
                TransactWrite::Put { item, condition } => (Key::of_item(item), *condition),
                TransactWrite::Delete { key, condition } => (Some(key.clone()), *condition),
                TransactWrite::Update { key, update } => (Some(key.clone()), update.condition),
            };
            if let Some(key) = key {
                if !condition_holds(&items, &key, condition) {
                    failed.push(format!("[{}] {}", index, key));
                }
            }
            if let TransactWrite::Update { key, update } = write {
                validate_update(items.get(key), update)?;
            }
        }
        if !failed.is_empty() {
            return Err(BackendError::TransactionCanceled {
                reason: format!("ConditionalCheckFailed on {}", failed.join(", ")),
                condition_failed: true,
            });
        }

        for write in writes {
            match write {
                TransactWrite::Put { item, .. } => {
                    if let Some(key) = Key::of_item(&item) {
                        items.insert(key, item);
                    }
                }
                TransactWrite::Delete { key, .. } => {
                    items.remove(&key);
                }
                TransactWrite::Update { key, update } => apply_update(&mut items, &key, &update),
            }
        }
        Ok(())
    }
}
