//! SQLite warehouse backend
//!
//! Runs the same statements as the Databricks backend against a local SQLite
//! database. Used for development and as the integration test harness; SQLite
//! has no catalog or schema layer, so tables are addressed by bare name.

use super::{ParameterType, ResultSet, SqlDialect, Statement, WarehouseClient};
use crate::config::TableNames;
use crate::error::{Result, WarehouseError};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Arguments, Column, Row, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::{debug, info};

/// Warehouse client backed by a SQLite connection pool
#[derive(Clone, Debug)]
pub struct SqliteWarehouse {
    pool: SqlitePool,
}

impl SqliteWarehouse {
    /// Connect to a database URL such as `sqlite:checkpoints.db`, creating the file if missing
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        debug!(url = %url, "Connecting to SQLite warehouse");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!(url = %url, "SQLite warehouse connection established");
        Ok(Self { pool })
    }

    /// A private in-memory database
    ///
    /// The pool keeps exactly one connection alive forever, since every new
    /// connection to `sqlite::memory:` would open a fresh, empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the checkpoint, write and store tables if they do not exist yet
    pub async fn create_tables(&self, tables: &TableNames) -> Result<()> {
        info!("Creating SQLite warehouse tables");
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    thread_id TEXT NOT NULL,
                    checkpoint_ns TEXT NOT NULL DEFAULT '',
                    checkpoint_id TEXT NOT NULL,
                    parent_checkpoint_id TEXT,
                    encoding TEXT NOT NULL,
                    checkpoint TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id)
                )",
                tables.checkpoints
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    thread_id TEXT NOT NULL,
                    checkpoint_ns TEXT NOT NULL DEFAULT '',
                    checkpoint_id TEXT NOT NULL,
                    task_id TEXT NOT NULL,
                    idx INTEGER NOT NULL,
                    channel TEXT NOT NULL,
                    encoding TEXT NOT NULL,
                    value TEXT,
                    write_type TEXT NOT NULL,
                    PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id, task_id, idx)
                )",
                tables.writes
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    prefix TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (prefix, key)
                )",
                tables.store
            ),
        ];

        for sql in statements {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| WarehouseError::Backend(format!("Failed to create table: {}", e)))?;
        }

        info!("SQLite warehouse tables ready");
        Ok(())
    }
}

#[async_trait]
impl WarehouseClient for SqliteWarehouse {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn execute(&self, statement: &Statement) -> Result<ResultSet> {
        let (sql, order) = positional_sql(&statement.sql)?;
        debug!(label = statement.label, parameters = order.len(), "Executing SQLite statement");

        let mut arguments = SqliteArguments::default();
        for name in &order {
            let parameter = statement.parameter(name).ok_or_else(|| {
                WarehouseError::Invalid(format!(
                    "statement {} references unbound parameter :{}",
                    statement.label, name
                ))
            })?;
            match parameter.type_name {
                ParameterType::BigInt => {
                    let value = parameter
                        .value
                        .as_deref()
                        .map(|v| {
                            v.parse::<i64>().map_err(|e| {
                                WarehouseError::Invalid(format!("parameter :{} is not an integer: {}", name, e))
                            })
                        })
                        .transpose()?;
                    arguments.add(value);
                }
                ParameterType::String | ParameterType::Timestamp => {
                    arguments.add(parameter.value.clone());
                }
            }
        }

        let rows = sqlx::query_with::<Sqlite, _>(&sql, arguments)
            .fetch_all(&self.pool)
            .await?;
        to_result_set(&rows)
    }
}

fn to_result_set(rows: &[SqliteRow]) -> Result<ResultSet> {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        let mut out = Vec::with_capacity(row.len());
        for index in 0..row.len() {
            out.push(column_text(row, index)?);
        }
        values.push(out);
    }
    Ok(ResultSet::new(columns, values))
}

/// Render one value as text, the way the Databricks API reports it
fn column_text(row: &SqliteRow, index: usize) -> Result<Option<String>> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(None);
    }
    let type_name = raw.type_info().name().to_string();
    let text = match type_name.as_str() {
        "INTEGER" => row.try_get_unchecked::<i64, _>(index)?.to_string(),
        "REAL" => row.try_get_unchecked::<f64, _>(index)?.to_string(),
        "BLOB" => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
            String::from_utf8_lossy(&bytes).into_owned()
        }
        _ => row.try_get_unchecked::<String, _>(index)?,
    };
    Ok(Some(text))
}

/// Rewrite `:name` markers to `?N` and return the names in binding order
///
/// A name used more than once maps to the same `?N`. Text inside quotes and `::`
/// casts are left untouched.
fn positional_sql(sql: &str) -> Result<(String, Vec<String>)> {
    let mut out = String::with_capacity(sql.len());
    let mut order: Vec<String> = Vec::new();
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
            }
            ':' if matches!(chars.peek(), Some((_, ':'))) => {
                out.push_str("::");
                chars.next();
            }
            ':' if matches!(chars.peek(), Some((_, n)) if n.is_ascii_alphabetic() || *n == '_') => {
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, n)) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        end = j + n.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let name = &sql[start..end];
                let position = match order.iter().position(|existing| existing == name) {
                    Some(position) => position,
                    None => {
                        order.push(name.to_string());
                        order.len() - 1
                    }
                };
                out.push('?');
                out.push_str(&(position + 1).to_string());
            }
            _ => out.push(c),
        }
    }

    if quote.is_some() {
        return Err(WarehouseError::Invalid("unterminated quoted text in statement".to_string()));
    }
    Ok((out, order))
}
