use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{BackendError, Condition, Item, Key, TableBackend, TransactWrite, UpdateSpec};
use crate::config::IdentityConfig;
use crate::{IdentityError, IdentityResult};

/// A [`TableBackend`] plus the settings every store call runs under.
///
/// Translates backend errors into [`IdentityError`] with the operation and
/// key attached, and applies the configured deadline.
#[derive(Clone)]
pub struct Table {
    backend: Arc<dyn TableBackend>,
    config: IdentityConfig,
}

impl Table {
    pub fn new<B: TableBackend + 'static>(backend: B, config: IdentityConfig) -> Self {
        Self::from_arc(Arc::new(backend), config)
    }

    pub fn from_arc(backend: Arc<dyn TableBackend>, config: IdentityConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn TableBackend> {
        &self.backend
    }

    async fn within_deadline<T, F>(&self, operation: &'static str, key: &str, fut: F) -> IdentityResult<T>
    where
        F: Future<Output = IdentityResult<T>>,
    {
        match self.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                IdentityError::Timeout {
                    operation,
                    key: key.to_string(),
                }
            })?,
            None => fut.await,
        }
    }

    pub async fn get(&self, operation: &'static str, key: &Key) -> IdentityResult<Option<Item>> {
        let label = key.to_string();
        self.within_deadline(operation, &label, async {
            self.backend
                .get_item(key, self.config.consistent_read)
                .await
                .map_err(|e| map_error(operation, &label, None, e))
        })
        .await
    }

    pub async fn put(
        &self,
        operation: &'static str,
        item: Item,
        condition: Option<Condition>,
    ) -> IdentityResult<()> {
        let label = Key::of_item(&item)
            .map(|k| k.to_string())
            .unwrap_or_default();
        self.within_deadline(operation, &label, async {
            self.backend
                .put_item(item, condition)
                .await
                .map_err(|e| map_error(operation, &label, condition, e))
        })
        .await
    }

    pub async fn delete(
        &self,
        operation: &'static str,
        key: &Key,
        condition: Option<Condition>,
    ) -> IdentityResult<()> {
        let label = key.to_string();
        self.within_deadline(operation, &label, async {
            self.backend
                .delete_item(key, condition)
                .await
                .map_err(|e| map_error(operation, &label, condition, e))
        })
        .await
    }

    pub async fn update(
        &self,
        operation: &'static str,
        key: &Key,
        update: UpdateSpec,
    ) -> IdentityResult<()> {
        let label = key.to_string();
        let condition = update.condition;
        self.within_deadline(operation, &label, async {
            self.backend
                .update_item(key, update)
                .await
                .map_err(|e| map_error(operation, &label, condition, e))
        })
        .await
    }

    /// All-or-nothing write. A failed condition is reported against the first
    /// conditioned write, as `AlreadyExists` or `NotFound`.
    pub async fn transact(
        &self,
        operation: &'static str,
        writes: Vec<TransactWrite>,
    ) -> IdentityResult<()> {
        let guarded = writes.iter().find_map(|w| {
            let condition = match w {
                TransactWrite::Put { condition, .. } | TransactWrite::Delete { condition, .. } => {
                    *condition
                }
                TransactWrite::Update { update, .. } => update.condition,
            };
            Some((w.key()?, condition?))
        });
        let label = writes
            .iter()
            .filter_map(TransactWrite::key)
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        self.within_deadline(operation, &label, async {
            self.backend
                .transact_write(writes)
                .await
                .map_err(|e| match (e, &guarded) {
                    (
                        BackendError::TransactionCanceled {
                            condition_failed: true,
                            ..
                        },
                        Some((key, condition)),
                    ) => map_error(
                        operation,
                        &key.to_string(),
                        Some(*condition),
                        BackendError::ConditionFailed,
                    ),
                    (other, _) => map_error(operation, &label, None, other),
                })
        })
        .await
    }

    /// Every item of `partition`, in sort-key order.
    ///
    /// Follows pagination to the end. The deadline covers the whole sequence
    /// of pages; a failure or timeout part way yields an error, never the
    /// pages read so far.
    pub async fn query_partition(
        &self,
        operation: &'static str,
        partition: &str,
    ) -> IdentityResult<Vec<Item>> {
        self.within_deadline(operation, partition, async {
            let mut items = Vec::new();
            let mut start: Option<Key> = None;
            let mut pages = 0usize;
            loop {
                let page = self
                    .backend
                    .query_page(
                        partition,
                        start.take(),
                        self.config.page_size,
                        self.config.consistent_read,
                    )
                    .await
                    .map_err(|e| map_error(operation, partition, None, e))?;
                pages += 1;
                items.extend(page.items);
                match page.last_evaluated_key {
                    Some(last) => start = Some(last),
                    None => break,
                }
            }
            debug!(operation, partition, pages, items = items.len(), "read partition");
            Ok(items)
        })
        .await
    }
}

fn map_error(
    operation: &'static str,
    key: &str,
    condition: Option<Condition>,
    error: BackendError,
) -> IdentityError {
    match error {
        BackendError::ConditionFailed => match condition {
            Some(Condition::NotExists) => IdentityError::already_exists(operation, key),
            Some(Condition::Exists) | None => IdentityError::not_found(operation, key),
        },
        BackendError::TransactionCanceled { reason, .. } => {
            IdentityError::TransactionAborted { operation, reason }
        }
        BackendError::Invalid { message } => {
            IdentityError::invalid(format!("{}: {}: {}", operation, key, message))
        }
        source @ BackendError::Unavailable { .. } => IdentityError::StoreUnavailable {
            operation,
            key: key.to_string(),
            source,
        },
    }
}
