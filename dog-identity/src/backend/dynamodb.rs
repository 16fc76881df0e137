//! [`TableBackend`] over Amazon DynamoDB.
//!
//! The table needs a string partition key `id` and a string sort key `rng`.
//! Provisioning is left to the deployment.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::config::http::HttpResponse;
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{
    AttributeValue as SdkValue, Delete, Put, TransactWriteItem, Update,
};
use aws_sdk_dynamodb::Client;
use tracing::debug;

use crate::backend::{
    AttributeValue, BackendError, BackendResult, Condition, Item, Key, QueryPage, TableBackend,
    TransactWrite, UpdateSpec, PARTITION_KEY,
};
use crate::config::IdentityConfig;

type SdkItem = HashMap<String, SdkValue>;

/// DynamoDB-backed table.
#[derive(Clone, Debug)]
pub struct DynamoDbTable {
    client: Client,
    table_name: String,
}

impl DynamoDbTable {
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Build a client from the default AWS provider chain, overridden by the
    /// region and endpoint in `config`.
    pub async fn from_config(config: &IdentityConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(url) = &config.endpoint_url {
            loader = loader.endpoint_url(url.as_str());
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config), config.table_name.clone())
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

fn to_sdk(value: AttributeValue) -> SdkValue {
    match value {
        AttributeValue::S(s) => SdkValue::S(s),
        AttributeValue::N(n) => SdkValue::N(n),
        AttributeValue::Ss(set) => SdkValue::Ss(set.into_iter().collect()),
        AttributeValue::Null => SdkValue::Null(true),
    }
}

/// Shapes the identity records never write are dropped.
fn from_sdk(value: SdkValue) -> Option<AttributeValue> {
    match value {
        SdkValue::S(s) => Some(AttributeValue::S(s)),
        SdkValue::N(n) => Some(AttributeValue::N(n)),
        SdkValue::Ss(values) => Some(AttributeValue::Ss(values.into_iter().collect())),
        SdkValue::Null(_) => Some(AttributeValue::Null),
        _ => None,
    }
}

fn to_sdk_item(item: Item) -> SdkItem {
    item.into_iter().map(|(k, v)| (k, to_sdk(v))).collect()
}

fn from_sdk_item(item: SdkItem) -> Item {
    item.into_iter()
        .filter_map(|(k, v)| from_sdk(v).map(|v| (k, v)))
        .collect()
}

fn key_map(key: &Key) -> SdkItem {
    to_sdk_item(key.to_item())
}

/// Expression attribute names and values for one request.
#[derive(Default)]
struct Placeholders {
    names: HashMap<String, String>,
    values: HashMap<String, SdkValue>,
}

impl Placeholders {
    fn name(&mut self, attribute: &str) -> String {
        if let Some((placeholder, _)) = self.names.iter().find(|(_, a)| *a == attribute) {
            return placeholder.clone();
        }
        let placeholder = format!("#n{}", self.names.len());
        self.names.insert(placeholder.clone(), attribute.to_string());
        placeholder
    }

    fn value(&mut self, value: SdkValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), value);
        placeholder
    }

    fn condition(&mut self, condition: Condition) -> String {
        let pk = self.name(PARTITION_KEY);
        match condition {
            Condition::NotExists => format!("attribute_not_exists({})", pk),
            Condition::Exists => format!("attribute_exists({})", pk),
        }
    }

    fn update(&mut self, update: &UpdateSpec) -> String {
        let mut clauses = Vec::new();

        let set: Vec<String> = update
            .set
            .iter()
            .map(|(attribute, value)| {
                format!("{} = {}", self.name(attribute), self.value(to_sdk(value.clone())))
            })
            .collect();
        if !set.is_empty() {
            clauses.push(format!("SET {}", set.join(", ")));
        }

        let add: Vec<String> = update
            .add
            .iter()
            .map(|(attribute, values)| {
                let values = SdkValue::Ss(values.iter().cloned().collect());
                format!("{} {}", self.name(attribute), self.value(values))
            })
            .collect();
        if !add.is_empty() {
            clauses.push(format!("ADD {}", add.join(", ")));
        }

        let delete: Vec<String> = update
            .delete
            .iter()
            .map(|(attribute, values)| {
                let values = SdkValue::Ss(values.iter().cloned().collect());
                format!("{} {}", self.name(attribute), self.value(values))
            })
            .collect();
        if !delete.is_empty() {
            clauses.push(format!("DELETE {}", delete.join(", ")));
        }

        clauses.join(" ")
    }

    fn into_parts(self) -> (Option<HashMap<String, String>>, Option<HashMap<String, SdkValue>>) {
        let names = (!self.names.is_empty()).then_some(self.names);
        let values = (!self.values.is_empty()).then_some(self.values);
        (names, values)
    }
}

fn classify<E>(error: SdkError<E, HttpResponse>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if error.code() == Some("ConditionalCheckFailedException") {
        return BackendError::ConditionFailed;
    }
    BackendError::unavailable(error)
}

fn classify_transaction(error: SdkError<TransactWriteItemsError, HttpResponse>) -> BackendError {
    if let SdkError::ServiceError(inner) = &error {
        if let TransactWriteItemsError::TransactionCanceledException(canceled) = inner.err() {
            let codes: Vec<&str> = canceled
                .cancellation_reasons()
                .iter()
                .map(|r| r.code().unwrap_or("None"))
                .collect();
            return BackendError::TransactionCanceled {
                condition_failed: codes.iter().any(|c| *c == "ConditionalCheckFailed"),
                reason: format!("[{}]", codes.join(", ")),
            };
        }
    }
    BackendError::unavailable(error)
}

fn build_error(error: aws_sdk_dynamodb::error::BuildError) -> BackendError {
    BackendError::invalid(error.to_string())
}

impl DynamoDbTable {
    fn transact_item(&self, write: TransactWrite) -> BackendResult<TransactWriteItem> {
        let mut placeholders = Placeholders::default();
        let item = match write {
            TransactWrite::Put { item, condition } => {
                let condition = condition.map(|c| placeholders.condition(c));
                let (names, _) = placeholders.into_parts();
                let put = Put::builder()
                    .table_name(&self.table_name)
                    .set_item(Some(to_sdk_item(item)))
                    .set_condition_expression(condition)
                    .set_expression_attribute_names(names)
                    .build()
                    .map_err(build_error)?;
                TransactWriteItem::builder().put(put).build()
            }
            TransactWrite::Delete { key, condition } => {
                let condition = condition.map(|c| placeholders.condition(c));
                let (names, _) = placeholders.into_parts();
                let delete = Delete::builder()
                    .table_name(&self.table_name)
                    .set_key(Some(key_map(&key)))
                    .set_condition_expression(condition)
                    .set_expression_attribute_names(names)
                    .build()
                    .map_err(build_error)?;
                TransactWriteItem::builder().delete(delete).build()
            }
            TransactWrite::Update { key, update } => {
                if update.is_noop() {
                    return Err(BackendError::invalid("update has no clauses"));
                }
                let expression = placeholders.update(&update);
                let condition = update.condition.map(|c| placeholders.condition(c));
                let (names, values) = placeholders.into_parts();
                let update = Update::builder()
                    .table_name(&self.table_name)
                    .set_key(Some(key_map(&key)))
                    .update_expression(expression)
                    .set_condition_expression(condition)
                    .set_expression_attribute_names(names)
                    .set_expression_attribute_values(values)
                    .build()
                    .map_err(build_error)?;
                TransactWriteItem::builder().update(update).build()
            }
        };
        Ok(item)
    }
}

#[async_trait]
impl TableBackend for DynamoDbTable {
    async fn get_item(&self, key: &Key, consistent: bool) -> BackendResult<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(key_map(key)))
            .consistent_read(consistent)
            .send()
            .await
            .map_err(classify)?;
        Ok(output.item.map(from_sdk_item))
    }

    async fn put_item(&self, item: Item, condition: Option<Condition>) -> BackendResult<()> {
        let mut placeholders = Placeholders::default();
        let condition = condition.map(|c| placeholders.condition(c));
        let (names, _) = placeholders.into_parts();
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_sdk_item(item)))
            .set_condition_expression(condition)
            .set_expression_attribute_names(names)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_item(&self, key: &Key, condition: Option<Condition>) -> BackendResult<()> {
        let mut placeholders = Placeholders::default();
        let condition = condition.map(|c| placeholders.condition(c));
        let (names, _) = placeholders.into_parts();
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(key_map(key)))
            .set_condition_expression(condition)
            .set_expression_attribute_names(names)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn update_item(&self, key: &Key, update: UpdateSpec) -> BackendResult<()> {
        if update.is_noop() {
            return Err(BackendError::invalid("update has no clauses"));
        }
        let mut placeholders = Placeholders::default();
        let expression = placeholders.update(&update);
        let condition = update.condition.map(|c| placeholders.condition(c));
        let (names, values) = placeholders.into_parts();
        self.client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(key_map(key)))
            .update_expression(expression)
            .set_condition_expression(condition)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn query_page(
        &self,
        partition: &str,
        exclusive_start: Option<Key>,
        limit: Option<u32>,
        consistent: bool,
    ) -> BackendResult<QueryPage> {
        let output = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("#pk = :pk")
            .expression_attribute_names("#pk", PARTITION_KEY)
            .expression_attribute_values(":pk", SdkValue::S(partition.to_string()))
            .set_exclusive_start_key(exclusive_start.as_ref().map(key_map))
            .set_limit(limit.map(|l| i32::try_from(l).unwrap_or(i32::MAX)))
            .consistent_read(consistent)
            .send()
            .await
            .map_err(classify)?;

        let items: Vec<Item> = output
            .items
            .unwrap_or_default()
            .into_iter()
            .map(from_sdk_item)
            .collect();
        let last_evaluated_key = output
            .last_evaluated_key
            .map(from_sdk_item)
            .and_then(|item| Key::of_item(&item));
        debug!(partition, items = items.len(), more = last_evaluated_key.is_some(), "query page");
        Ok(QueryPage {
            items,
            last_evaluated_key,
        })
    }

    async fn transact_write(&self, writes: Vec<TransactWrite>) -> BackendResult<()> {
        let items = writes
            .into_iter()
            .map(|w| self.transact_item(w))
            .collect::<BackendResult<Vec<_>>>()?;
        self.client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
            .map_err(classify_transaction)?;
        Ok(())
    }
}
