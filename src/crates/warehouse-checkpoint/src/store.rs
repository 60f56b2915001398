//! Hierarchical key-value store for long-lived memory
//!
//! Items are addressed by a namespace (an ordered list of labels such as
//! `["tenant-1", "user-42", "preferences"]`) and a key. Searching a namespace
//! prefix returns every item at or below it, so `["tenant-1"]` covers
//! `["tenant-1", "user-42"]` and `["tenant-1", "user-7", "notes"]`.
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use warehouse_checkpoint::config::TableConfig;
//! use warehouse_checkpoint::store::{SearchQuery, Store, WarehouseStore};
//! use warehouse_checkpoint::warehouse::SqliteWarehouse;
//!
//! # async fn example() -> warehouse_checkpoint::Result<()> {
//! let warehouse = SqliteWarehouse::connect("sqlite:memory.db").await?;
//! let store = WarehouseStore::new(warehouse, &TableConfig::default())?;
//!
//! store.put(&["users", "alice"], "prefs", json!({"theme": "dark"})).await?;
//! let dark = store
//!     .search(&["users"], SearchQuery::new().with_filter(json!({"theme": "dark"}))?)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Filters
//!
//! Filters are matched against the decoded value, client side:
//!
//! - a plain value matches by equality: `{"status": "active"}`
//! - a nested object matches as a subset: `{"profile": {"lang": "en"}}`
//! - an operator object compares: `{"score": {"$gte": 4, "$lt": 10}}` with
//!   `$eq`, `$ne`, `$gt`, `$gte`, `$lt` and `$lte` on numbers or strings

use crate::config::TableConfig;
use crate::error::{Result, WarehouseError};
use crate::repository::{StoreRepository, StoreRow};
use crate::warehouse::WarehouseClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Separator between namespace labels in the stored prefix
pub const NAMESPACE_SEPARATOR: char = '.';

/// First label reserved for internal use
pub const RESERVED_LABEL: &str = "langgraph";

/// Label matching any single label in [`NamespaceQuery`] prefixes and suffixes
pub const WILDCARD: &str = "*";

const SEARCH_PAGE_SIZE: usize = 100;

/// A stored item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    fn from_row(row: StoreRow) -> Result<Self> {
        Ok(Self {
            namespace: split_namespace(&row.prefix),
            key: row.key,
            value: serde_json::from_str(&row.value)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Options for [`Store::search`]
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub filter: Option<Map<String, Value>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            filter: None,
            limit: 10,
            offset: 0,
        }
    }
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only items whose value matches `filter`, which must be a JSON object
    pub fn with_filter(mut self, filter: Value) -> Result<Self> {
        match filter {
            Value::Object(map) => {
                validate_filter(&map)?;
                self.filter = Some(map);
                Ok(self)
            }
            other => Err(WarehouseError::Invalid(format!(
                "filter must be a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Options for [`Store::list_namespaces`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceQuery {
    /// Leading labels; [`WILDCARD`] matches any label
    pub prefix: Option<Vec<String>>,
    /// Trailing labels; [`WILDCARD`] matches any label
    pub suffix: Option<Vec<String>>,
    /// Truncate returned namespaces to this many labels
    pub max_depth: Option<usize>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for NamespaceQuery {
    fn default() -> Self {
        Self {
            prefix: None,
            suffix: None,
            max_depth: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl NamespaceQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix<I, L>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.prefix = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_suffix<I, L>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.suffix = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn matches(&self, namespace: &[String]) -> bool {
        let label_matches = |pattern: &String, label: &String| pattern == WILDCARD || pattern == label;
        if let Some(prefix) = &self.prefix {
            if prefix.len() > namespace.len()
                || !prefix.iter().zip(namespace).all(|(p, l)| label_matches(p, l))
            {
                return false;
            }
        }
        if let Some(suffix) = &self.suffix {
            if suffix.len() > namespace.len()
                || !suffix
                    .iter()
                    .rev()
                    .zip(namespace.iter().rev())
                    .all(|(p, l)| label_matches(p, l))
            {
                return false;
            }
        }
        true
    }

    /// Labels before the first wildcard, usable as a stored-prefix restriction
    fn literal_prefix(&self) -> Vec<&str> {
        self.prefix
            .iter()
            .flatten()
            .take_while(|label| label.as_str() != WILDCARD)
            .map(String::as_str)
            .collect()
    }
}

/// Namespaced key-value store
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or overwrite the item at `(namespace, key)`
    async fn put(&self, namespace: &[&str], key: &str, value: Value) -> Result<()>;

    /// The item at `(namespace, key)`, `None` when absent
    async fn get(&self, namespace: &[&str], key: &str) -> Result<Option<Item>>;

    /// Remove the item at `(namespace, key)`; removing an absent item succeeds
    async fn delete(&self, namespace: &[&str], key: &str) -> Result<()>;

    /// Items at or below `namespace_prefix` matching the query
    async fn search(&self, namespace_prefix: &[&str], query: SearchQuery) -> Result<Vec<Item>>;

    /// Distinct namespaces holding items, sorted
    async fn list_namespaces(&self, query: NamespaceQuery) -> Result<Vec<Vec<String>>>;
}

/// [`Store`] persisting to a SQL warehouse
#[derive(Debug, Clone)]
pub struct WarehouseStore {
    repo: StoreRepository,
}

impl WarehouseStore {
    pub fn new(client: impl WarehouseClient + 'static, tables: &TableConfig) -> Result<Self> {
        Self::from_shared(Arc::new(client), tables)
    }

    /// Create a store sharing a client with savers or other stores
    pub fn from_shared(client: Arc<dyn WarehouseClient>, tables: &TableConfig) -> Result<Self> {
        let names = Arc::new(tables.resolve(client.dialect())?);
        Ok(Self {
            repo: StoreRepository::new(client, names),
        })
    }

    async fn search_filtered(
        &self,
        prefix: &str,
        filter: &Map<String, Value>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut skipped = 0;
        let mut page_offset = 0;

        while items.len() < limit {
            let rows = self
                .repo
                .search(prefix, Some(SEARCH_PAGE_SIZE), page_offset)
                .await?;
            let exhausted = rows.len() < SEARCH_PAGE_SIZE;
            page_offset += rows.len();

            for row in rows {
                let item = Item::from_row(row)?;
                if !matches_filter(&item.value, filter) {
                    continue;
                }
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                items.push(item);
                if items.len() == limit {
                    break;
                }
            }
            if exhausted {
                break;
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl Store for WarehouseStore {
    #[tracing::instrument(skip(self, value))]
    async fn put(&self, namespace: &[&str], key: &str, value: Value) -> Result<()> {
        validate_namespace(namespace)?;
        let prefix = join_namespace(namespace);
        let text = serde_json::to_string(&value)?;
        self.repo.upsert(&prefix, key, &text, Utc::now()).await
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, namespace: &[&str], key: &str) -> Result<Option<Item>> {
        validate_namespace(namespace)?;
        self.repo
            .get(&join_namespace(namespace), key)
            .await?
            .map(Item::from_row)
            .transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, namespace: &[&str], key: &str) -> Result<()> {
        validate_namespace(namespace)?;
        self.repo.delete(&join_namespace(namespace), key).await
    }

    #[tracing::instrument(skip(self, query), fields(limit = query.limit, offset = query.offset))]
    async fn search(&self, namespace_prefix: &[&str], query: SearchQuery) -> Result<Vec<Item>> {
        validate_labels(namespace_prefix)?;
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let prefix = join_namespace(namespace_prefix);

        match &query.filter {
            Some(filter) if !filter.is_empty() => {
                validate_filter(filter)?;
                let items = self
                    .search_filtered(&prefix, filter, query.limit, query.offset)
                    .await?;
                debug!(found = items.len(), "Filtered search complete");
                Ok(items)
            }
            _ => self
                .repo
                .search(&prefix, Some(query.limit), query.offset)
                .await?
                .into_iter()
                .map(Item::from_row)
                .collect(),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn list_namespaces(&self, query: NamespaceQuery) -> Result<Vec<Vec<String>>> {
        let literal = query.literal_prefix();
        validate_labels(&literal)?;
        let prefixes = self.repo.list_prefixes(&join_namespace(&literal)).await?;

        let namespaces: BTreeSet<Vec<String>> = prefixes
            .iter()
            .map(|prefix| split_namespace(prefix))
            .filter(|namespace| query.matches(namespace))
            .map(|mut namespace| {
                if let Some(depth) = query.max_depth {
                    namespace.truncate(depth);
                }
                namespace
            })
            .collect();

        Ok(namespaces
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }
}

fn join_namespace(namespace: &[&str]) -> String {
    namespace.join(&NAMESPACE_SEPARATOR.to_string())
}

fn split_namespace(prefix: &str) -> Vec<String> {
    if prefix.is_empty() {
        return Vec::new();
    }
    prefix.split(NAMESPACE_SEPARATOR).map(str::to_string).collect()
}

/// Labels must be non-empty, free of the separator, and not start with the reserved label
fn validate_labels(labels: &[&str]) -> Result<()> {
    if labels.first() == Some(&RESERVED_LABEL) {
        return Err(WarehouseError::Invalid(format!(
            "namespace cannot start with the reserved label {:?}",
            RESERVED_LABEL
        )));
    }
    for label in labels {
        if label.is_empty() {
            return Err(WarehouseError::Invalid("namespace labels must not be empty".to_string()));
        }
        if label.contains(NAMESPACE_SEPARATOR) {
            return Err(WarehouseError::Invalid(format!(
                "namespace label {:?} must not contain {:?}",
                label, NAMESPACE_SEPARATOR
            )));
        }
    }
    Ok(())
}

/// A namespace that addresses items: valid labels, at least one of them
pub fn validate_namespace(namespace: &[&str]) -> Result<()> {
    if namespace.is_empty() {
        return Err(WarehouseError::Invalid("namespace must not be empty".to_string()));
    }
    validate_labels(namespace)
}

const OPERATORS: &[&str] = &["$eq", "$ne", "$gt", "$gte", "$lt", "$lte"];

fn is_operator_object(condition: &Map<String, Value>) -> bool {
    !condition.is_empty() && condition.keys().all(|key| key.starts_with('$'))
}

fn validate_filter(filter: &Map<String, Value>) -> Result<()> {
    for condition in filter.values() {
        if let Value::Object(inner) = condition {
            if is_operator_object(inner) {
                if let Some(op) = inner.keys().find(|op| !OPERATORS.contains(&op.as_str())) {
                    return Err(WarehouseError::Invalid(format!("unsupported filter operator {}", op)));
                }
            } else {
                validate_filter(inner)?;
            }
        }
    }
    Ok(())
}

/// Whether `value` satisfies every condition of `filter`
pub fn matches_filter(value: &Value, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(field, condition)| matches_condition(value.get(field), condition))
}

fn matches_condition(field: Option<&Value>, condition: &Value) -> bool {
    match condition {
        Value::Object(ops) if is_operator_object(ops) => ops
            .iter()
            .all(|(op, operand)| apply_operator(field, op, operand)),
        Value::Object(nested) => match field {
            Some(inner @ Value::Object(_)) => matches_filter(inner, nested),
            _ => false,
        },
        expected => field.is_some_and(|f| values_equal(f, expected)),
    }
}

fn apply_operator(field: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$eq" => field.is_some_and(|f| values_equal(f, operand)),
        "$ne" => !field.is_some_and(|f| values_equal(f, operand)),
        _ => {
            let Some(ordering) = field.and_then(|f| compare_values(f, operand)) else {
                return false;
            };
            match op {
                "$gt" => ordering == Ordering::Greater,
                "$gte" => ordering != Ordering::Less,
                "$lt" => ordering == Ordering::Less,
                "$lte" => ordering != Ordering::Greater,
                _ => false,
            }
        }
    }
}

/// JSON equality where `1` and `1.0` are the same number
pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => l == r,
        },
        (Value::Array(l), Value::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(l), Value::Object(r)) => {
            l.len() == r.len()
                && l.iter().all(|(key, a)| r.get(key).is_some_and(|b| values_equal(a, b)))
        }
        _ => left == right,
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}
