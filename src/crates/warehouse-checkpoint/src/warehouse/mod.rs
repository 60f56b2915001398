//! Statement execution against a SQL warehouse
//!
//! The warehouse offers exactly one capability: run a SQL string with named
//! parameters and hand back a rectangular result of text scalars. There are no
//! transactions, cursors or prepared handles; every call is one round trip.
//!
//! - [`WarehouseClient`] - the single `execute` capability, implemented by
//!   [`DatabricksWarehouse`], [`SqliteWarehouse`] and the [`RetryingWarehouse`] wrapper
//! - [`Statement`] - SQL text plus typed, named parameters (`:name` markers)
//! - [`ResultSet`] / [`Row`] - returned rows with typed accessors that fail with
//!   [`WarehouseError::Backend`] when a value cannot be coerced
//! - [`SqlDialect`] - the statement shapes that differ between backends

pub mod databricks;
pub mod dialect;
pub mod retry;
pub mod sqlite;

pub use databricks::{DatabricksConfig, DatabricksWarehouse};
pub use dialect::{ColumnValue, SqlDialect};
pub use retry::{with_retry, RetryPolicy, RetryingWarehouse};
pub use sqlite::SqliteWarehouse;

use crate::error::{Result, WarehouseError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use std::sync::Arc;

/// Declared type of a statement parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    String,
    BigInt,
    Timestamp,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "STRING",
            ParameterType::BigInt => "BIGINT",
            ParameterType::Timestamp => "TIMESTAMP",
        }
    }
}

/// A named statement parameter; `None` binds SQL NULL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementParameter {
    pub name: String,
    pub value: Option<String>,
    pub type_name: ParameterType,
}

/// SQL text with named `:parameter` markers and their values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Short operation label used in logs
    pub label: &'static str,
    pub sql: String,
    pub parameters: Vec<StatementParameter>,
}

impl Statement {
    pub fn new(label: &'static str, sql: impl Into<String>) -> Self {
        Self {
            label,
            sql: sql.into(),
            parameters: Vec::new(),
        }
    }

    fn push(mut self, name: impl Into<String>, value: Option<String>, type_name: ParameterType) -> Self {
        self.parameters.push(StatementParameter {
            name: name.into(),
            value,
            type_name,
        });
        self
    }

    /// Bind a string parameter
    pub fn bind(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, Some(value.into()), ParameterType::String)
    }

    /// Bind a nullable string parameter
    pub fn bind_opt(self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        self.push(name, value.map(Into::into), ParameterType::String)
    }

    /// Bind an integer parameter
    pub fn bind_i64(self, name: impl Into<String>, value: i64) -> Self {
        self.push(name, Some(value.to_string()), ParameterType::BigInt)
    }

    /// Append already-built parameters
    pub fn with_parameters(mut self, parameters: Vec<StatementParameter>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    /// Look up a bound parameter by name
    pub fn parameter(&self, name: &str) -> Option<&StatementParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Rows returned by one statement; every value arrives as nullable text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { columns, rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate rows with column-name accessors
    pub fn iter(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(move |values| Row {
            columns: &self.columns,
            values,
        })
    }

    /// First row, if any
    pub fn first(&self) -> Option<Row<'_>> {
        self.iter().next()
    }
}

/// One result row
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [String],
    values: &'a [Option<String>],
}

impl<'a> Row<'a> {
    fn raw(&self, column: &str) -> Result<Option<&'a str>> {
        let index = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .ok_or_else(|| WarehouseError::malformed(format!("missing column {:?}", column)))?;
        let value = self
            .values
            .get(index)
            .ok_or_else(|| WarehouseError::malformed(format!("short row, no value for {:?}", column)))?;
        Ok(value.as_deref())
    }

    /// Nullable text value
    pub fn opt_string(&self, column: &str) -> Result<Option<&'a str>> {
        self.raw(column)
    }

    /// Non-null text value
    pub fn string(&self, column: &str) -> Result<&'a str> {
        self.raw(column)?
            .ok_or_else(|| WarehouseError::malformed(format!("unexpected NULL in {:?}", column)))
    }

    /// Non-null integer value
    pub fn i64(&self, column: &str) -> Result<i64> {
        let text = self.string(column)?;
        text.trim().parse::<i64>().map_err(|e| {
            WarehouseError::malformed(format!("{:?} is not an integer ({}): {:?}", column, e, text))
        })
    }

    /// Non-null timestamp value
    pub fn timestamp(&self, column: &str) -> Result<DateTime<Utc>> {
        let text = self.string(column)?;
        parse_timestamp(text).ok_or_else(|| {
            WarehouseError::malformed(format!("{:?} is not a timestamp: {:?}", column, text))
        })
    }
}

/// Format a timestamp the way parameters are bound
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse RFC 3339 or `YYYY-MM-DD HH:MM:SS[.fff]` (taken as UTC)
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

/// A backend that executes one SQL statement per call
///
/// Implementations perform exactly one logical round trip and never retry; wrap
/// a client in [`RetryingWarehouse`] to add a backoff policy.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Statement shapes this backend understands
    fn dialect(&self) -> SqlDialect;

    /// Execute a statement and return its rows
    async fn execute(&self, statement: &Statement) -> Result<ResultSet>;
}

#[async_trait]
impl<C: WarehouseClient + ?Sized> WarehouseClient for Arc<C> {
    fn dialect(&self) -> SqlDialect {
        (**self).dialect()
    }

    async fn execute(&self, statement: &Statement) -> Result<ResultSet> {
        (**self).execute(statement).await
    }
}
