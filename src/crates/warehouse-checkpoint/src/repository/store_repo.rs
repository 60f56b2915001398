//! Store table access
//!
//! A namespace is stored as its labels joined with `.` in the `prefix` column.
//! Labels never contain `.`, so "`prefix` equals P or starts with `P.`" is exactly
//! "namespace lies under P".

use super::{limit_clause, where_clause};
use crate::config::TableNames;
use crate::error::Result;
use crate::warehouse::{ColumnValue, ResultSet, Row, Statement, WarehouseClient};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

const STORE_COLUMNS: &str = "prefix, key, value, created_at, updated_at";

/// One stored item row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRow {
    pub prefix: String,
    pub key: String,
    /// Value as JSON text
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoreRow {
    fn from_row(row: Row<'_>) -> Result<Self> {
        Ok(Self {
            prefix: row.string("prefix")?.to_string(),
            key: row.string("key")?.to_string(),
            value: row.string("value")?.to_string(),
            created_at: row.timestamp("created_at")?,
            updated_at: row.timestamp("updated_at")?,
        })
    }
}

/// Repository for the store table
#[derive(Clone)]
pub struct StoreRepository {
    client: Arc<dyn WarehouseClient>,
    tables: Arc<TableNames>,
}

impl std::fmt::Debug for StoreRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRepository")
            .field("store", &self.tables.store)
            .finish()
    }
}

impl StoreRepository {
    pub fn new(client: Arc<dyn WarehouseClient>, tables: Arc<TableNames>) -> Self {
        Self { client, tables }
    }

    async fn run(&self, statement: Statement) -> Result<ResultSet> {
        debug!(label = statement.label, table = %self.tables.store, "Executing statement");
        self.client.execute(&statement).await
    }

    /// Insert or overwrite an item; `created_at` is kept when the item exists
    pub async fn upsert(&self, prefix: &str, key: &str, value: &str, now: DateTime<Utc>) -> Result<()> {
        let row = vec![
            ColumnValue::string("prefix", prefix),
            ColumnValue::string("key", key),
            ColumnValue::string("value", value),
            ColumnValue::timestamp("created_at", now),
            ColumnValue::timestamp("updated_at", now),
        ];
        let statement = self.client.dialect().upsert(
            "store_put",
            &self.tables.store,
            &[row],
            &["prefix", "key"],
            &["value", "updated_at"],
        )?;
        self.run(statement).await?;
        Ok(())
    }

    pub async fn get(&self, prefix: &str, key: &str) -> Result<Option<StoreRow>> {
        let statement = Statement::new(
            "store_get",
            format!(
                "SELECT {STORE_COLUMNS} FROM {} WHERE prefix = :prefix AND key = :key",
                self.tables.store
            ),
        )
        .bind("prefix", prefix)
        .bind("key", key);

        let result = self.run(statement).await?;
        result.first().map(StoreRow::from_row).transpose()
    }

    pub async fn delete(&self, prefix: &str, key: &str) -> Result<()> {
        let statement = Statement::new(
            "store_delete",
            format!(
                "DELETE FROM {} WHERE prefix = :prefix AND key = :key",
                self.tables.store
            ),
        )
        .bind("prefix", prefix)
        .bind("key", key);

        self.run(statement).await?;
        Ok(())
    }

    /// Items under `prefix` (every item when empty), most recently updated first
    pub async fn search(
        &self,
        prefix: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<StoreRow>> {
        let (conditions, statement) = prefix_condition(prefix, Statement::new("store_search", String::new()));
        let statement = Statement {
            sql: format!(
                "SELECT {STORE_COLUMNS} FROM {}{} ORDER BY updated_at DESC, prefix, key{}",
                self.tables.store,
                where_clause(&conditions),
                limit_clause(limit, offset),
            ),
            ..statement
        };

        let result = self.run(statement).await?;
        result.iter().map(StoreRow::from_row).collect()
    }

    /// Distinct stored prefixes under `prefix` (every prefix when empty), sorted
    pub async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let (conditions, statement) =
            prefix_condition(prefix, Statement::new("store_list_prefixes", String::new()));
        let statement = Statement {
            sql: format!(
                "SELECT DISTINCT prefix FROM {}{} ORDER BY prefix",
                self.tables.store,
                where_clause(&conditions),
            ),
            ..statement
        };

        let result = self.run(statement).await?;
        result
            .iter()
            .map(|row| row.string("prefix").map(str::to_string))
            .collect()
    }
}

fn prefix_condition(prefix: &str, statement: Statement) -> (Vec<String>, Statement) {
    if prefix.is_empty() {
        return (Vec::new(), statement);
    }
    let dotted = format!("{}.", prefix);
    let statement = statement
        .bind("prefix", prefix)
        .bind_i64("prefix_len", dotted.chars().count() as i64)
        .bind("prefix_dot", dotted);
    (
        vec!["(prefix = :prefix OR substr(prefix, 1, :prefix_len) = :prefix_dot)".to_string()],
        statement,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sqlite_tables;
    use chrono::Duration;

    #[tokio::test]
    async fn test_upsert_keeps_created_at() {
        let (client, tables) = sqlite_tables().await;
        let repo = StoreRepository::new(client, tables);
        let first = Utc::now();
        let later = first + Duration::seconds(5);

        repo.upsert("a.b", "k", r#"{"v":1}"#, first).await.unwrap();
        repo.upsert("a.b", "k", r#"{"v":2}"#, later).await.unwrap();

        let row = repo.get("a.b", "k").await.unwrap().unwrap();
        assert_eq!(row.value, r#"{"v":2}"#);
        assert_eq!(
            row.created_at.timestamp_millis(),
            first.timestamp_millis()
        );
        assert_eq!(row.updated_at.timestamp_millis(), later.timestamp_millis());
    }

    #[tokio::test]
    async fn test_prefix_match_respects_label_boundaries() {
        let (client, tables) = sqlite_tables().await;
        let repo = StoreRepository::new(client, tables);
        let now = Utc::now();

        for prefix in ["a", "a.b", "a.c.d", "ab", "b"] {
            repo.upsert(prefix, "k", "1", now).await.unwrap();
        }

        let mut found: Vec<String> = repo
            .search("a", None, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.prefix)
            .collect();
        found.sort();
        assert_eq!(found, vec!["a", "a.b", "a.c.d"]);

        assert_eq!(repo.list_prefixes("").await.unwrap().len(), 5);
        assert_eq!(repo.list_prefixes("a.c").await.unwrap(), vec!["a.c.d"]);
    }

    #[tokio::test]
    async fn test_delete_missing_item_is_ok() {
        let (client, tables) = sqlite_tables().await;
        let repo = StoreRepository::new(client, tables);
        repo.delete("nowhere", "k").await.unwrap();
        assert!(repo.get("nowhere", "k").await.unwrap().is_none());
    }
}
