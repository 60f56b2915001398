//! Table access for checkpoints, pending writes and store items
//!
//! Repositories own the SQL. They speak in stored rows (encoded scalars plus
//! identity columns) and leave decoding to the saver and the store.

pub mod checkpoint_repo;
pub mod store_repo;

pub use checkpoint_repo::{CheckpointRepository, CheckpointRow, ListQuery, WriteRow};
pub use store_repo::{StoreRepository, StoreRow};

use crate::warehouse::StatementParameter;

/// Render a `LIMIT`/`OFFSET` tail; both are integers chosen by this crate
pub(crate) fn limit_clause(limit: Option<usize>, offset: usize) -> String {
    match (limit, offset) {
        (Some(limit), 0) => format!(" LIMIT {}", limit),
        (Some(limit), offset) => format!(" LIMIT {} OFFSET {}", limit, offset),
        // SQLite and Databricks both need a LIMIT before OFFSET
        (None, 0) => String::new(),
        (None, offset) => format!(" LIMIT {} OFFSET {}", i64::MAX, offset),
    }
}

/// Join `AND` conditions into a `WHERE` clause, empty when there are none
pub(crate) fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

pub(crate) fn string_param(name: impl Into<String>, value: impl Into<String>) -> StatementParameter {
    StatementParameter {
        name: name.into(),
        value: Some(value.into()),
        type_name: crate::warehouse::ParameterType::String,
    }
}
