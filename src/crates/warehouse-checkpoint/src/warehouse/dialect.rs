//! Statement shapes that differ between warehouse backends
//!
//! Reads and deletes use SQL both backends accept. Writes do not: Databricks
//! expresses upserts and guarded inserts with `MERGE INTO` and reports counts in
//! a `num_inserted_rows` column, while SQLite uses `INSERT .. ON CONFLICT` and
//! reports inserted rows through `RETURNING`.

use super::{ParameterType, ResultSet, Statement, StatementParameter};
use crate::error::{Result, WarehouseError};
use chrono::{DateTime, Utc};

/// SQL dialect spoken by a warehouse backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDialect {
    /// Databricks SQL warehouses (Delta tables)
    Databricks,
    /// SQLite, used for local development and tests
    Sqlite,
}

/// One column value of a row to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnValue {
    pub column: &'static str,
    pub value: Option<String>,
    pub type_name: ParameterType,
}

impl ColumnValue {
    pub fn string(column: &'static str, value: impl Into<String>) -> Self {
        Self {
            column,
            value: Some(value.into()),
            type_name: ParameterType::String,
        }
    }

    pub fn opt_string(column: &'static str, value: Option<impl Into<String>>) -> Self {
        Self {
            column,
            value: value.map(Into::into),
            type_name: ParameterType::String,
        }
    }

    pub fn bigint(column: &'static str, value: i64) -> Self {
        Self {
            column,
            value: Some(value.to_string()),
            type_name: ParameterType::BigInt,
        }
    }

    pub fn timestamp(column: &'static str, value: DateTime<Utc>) -> Self {
        Self {
            column,
            value: Some(super::format_timestamp(value)),
            type_name: ParameterType::Timestamp,
        }
    }
}

fn placeholder(column: &str, row: usize) -> String {
    format!("{}_{}", column, row)
}

fn bind_rows(rows: &[Vec<ColumnValue>]) -> Vec<StatementParameter> {
    rows.iter()
        .enumerate()
        .flat_map(|(i, row)| {
            row.iter().map(move |cv| StatementParameter {
                name: placeholder(cv.column, i),
                value: cv.value.clone(),
                type_name: cv.type_name,
            })
        })
        .collect()
}

fn columns_of(rows: &[Vec<ColumnValue>]) -> Result<Vec<&'static str>> {
    let first = rows
        .first()
        .ok_or_else(|| WarehouseError::Invalid("no rows to write".to_string()))?;
    let columns: Vec<&'static str> = first.iter().map(|cv| cv.column).collect();
    if rows
        .iter()
        .any(|row| row.iter().map(|cv| cv.column).ne(columns.iter().copied()))
    {
        return Err(WarehouseError::Invalid(
            "rows of one write must share a column layout".to_string(),
        ));
    }
    Ok(columns)
}

impl SqlDialect {
    /// Insert rows, overwriting `update_columns` of rows whose key already exists
    ///
    /// Rows within one call must have distinct keys.
    pub fn upsert(
        &self,
        label: &'static str,
        table: &str,
        rows: &[Vec<ColumnValue>],
        key_columns: &[&str],
        update_columns: &[&str],
    ) -> Result<Statement> {
        let columns = columns_of(rows)?;
        let sql = match self {
            SqlDialect::Databricks => {
                let source = merge_source(&columns, rows.len());
                let set = update_columns
                    .iter()
                    .map(|c| format!("{c} = source.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "MERGE INTO {table} AS target USING ({source}) AS source ON {on} \
                     WHEN MATCHED THEN UPDATE SET {set} \
                     WHEN NOT MATCHED THEN INSERT ({cols}) VALUES ({src_cols})",
                    on = merge_condition(key_columns),
                    cols = columns.join(", "),
                    src_cols = source_columns(&columns),
                )
            }
            SqlDialect::Sqlite => {
                let set = update_columns
                    .iter()
                    .map(|c| format!("{c} = excluded.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "INSERT INTO {table} ({cols}) VALUES {values} \
                     ON CONFLICT ({keys}) DO UPDATE SET {set}",
                    cols = columns.join(", "),
                    values = values_list(&columns, rows.len()),
                    keys = key_columns.join(", "),
                )
            }
        };
        Ok(Statement::new(label, sql).with_parameters(bind_rows(rows)))
    }

    /// Insert one row unless a row with the same key exists
    ///
    /// Pair with [`inserted_rows`](Self::inserted_rows) to learn whether the row
    /// was written or the key was already taken.
    pub fn insert_if_absent(
        &self,
        label: &'static str,
        table: &str,
        row: Vec<ColumnValue>,
        key_columns: &[&str],
    ) -> Result<Statement> {
        let rows = vec![row];
        let columns = columns_of(&rows)?;
        let sql = match self {
            SqlDialect::Databricks => format!(
                "MERGE INTO {table} AS target USING ({source}) AS source ON {on} \
                 WHEN NOT MATCHED THEN INSERT ({cols}) VALUES ({src_cols})",
                source = merge_source(&columns, 1),
                on = merge_condition(key_columns),
                cols = columns.join(", "),
                src_cols = source_columns(&columns),
            ),
            SqlDialect::Sqlite => format!(
                "INSERT INTO {table} ({cols}) VALUES {values} \
                 ON CONFLICT ({keys}) DO NOTHING RETURNING 1 AS inserted",
                cols = columns.join(", "),
                values = values_list(&columns, 1),
                keys = key_columns.join(", "),
            ),
        };
        Ok(Statement::new(label, sql).with_parameters(bind_rows(&rows)))
    }

    /// Number of rows a write statement inserted
    pub fn inserted_rows(&self, result: &ResultSet) -> Result<u64> {
        match self {
            SqlDialect::Databricks => {
                let Some(row) = result.first() else {
                    return Err(WarehouseError::malformed("MERGE returned no metrics row"));
                };
                let count = match row.i64("num_inserted_rows") {
                    Ok(count) => count,
                    Err(_) => row.i64("num_affected_rows")?,
                };
                Ok(count.max(0) as u64)
            }
            SqlDialect::Sqlite => Ok(result.len() as u64),
        }
    }
}

fn merge_source(columns: &[&str], rows: usize) -> String {
    (0..rows)
        .map(|i| {
            let select = columns
                .iter()
                .map(|c| format!(":{} AS {}", placeholder(c, i), c))
                .collect::<Vec<_>>()
                .join(", ");
            format!("SELECT {}", select)
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

fn merge_condition(key_columns: &[&str]) -> String {
    key_columns
        .iter()
        .map(|c| format!("target.{c} = source.{c}"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn source_columns(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| format!("source.{}", c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn values_list(columns: &[&str], rows: usize) -> String {
    (0..rows)
        .map(|i| {
            let markers = columns
                .iter()
                .map(|c| format!(":{}", placeholder(c, i)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", markers)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, value: &str) -> Vec<ColumnValue> {
        vec![
            ColumnValue::string("k", key),
            ColumnValue::bigint("n", 1),
            ColumnValue::string("v", value),
        ]
    }

    #[test]
    fn test_databricks_upsert_merges_all_rows() {
        let statement = SqlDialect::Databricks
            .upsert("upsert", "`c`.`s`.`t`", &[row("a", "1"), row("b", "2")], &["k", "n"], &["v"])
            .unwrap();

        assert!(statement.sql.starts_with("MERGE INTO `c`.`s`.`t` AS target"));
        assert!(statement.sql.contains("SELECT :k_0 AS k, :n_0 AS n, :v_0 AS v UNION ALL SELECT :k_1 AS k"));
        assert!(statement.sql.contains("ON target.k = source.k AND target.n = source.n"));
        assert!(statement.sql.contains("WHEN MATCHED THEN UPDATE SET v = source.v"));
        assert_eq!(statement.parameters.len(), 6);
        assert_eq!(statement.parameter("v_1").unwrap().value.as_deref(), Some("2"));
        assert_eq!(statement.parameter("n_0").unwrap().type_name, ParameterType::BigInt);
    }

    #[test]
    fn test_sqlite_upsert_uses_on_conflict() {
        let statement = SqlDialect::Sqlite
            .upsert("upsert", "`t`", &[row("a", "1")], &["k", "n"], &["v"])
            .unwrap();
        assert_eq!(
            statement.sql,
            "INSERT INTO `t` (k, n, v) VALUES (:k_0, :n_0, :v_0) ON CONFLICT (k, n) DO UPDATE SET v = excluded.v"
        );
    }

    #[test]
    fn test_insert_if_absent_never_updates() {
        let databricks = SqlDialect::Databricks
            .insert_if_absent("insert", "`t`", row("a", "1"), &["k"])
            .unwrap();
        assert!(!databricks.sql.contains("WHEN MATCHED"));
        assert!(databricks.sql.contains("WHEN NOT MATCHED THEN INSERT (k, n, v) VALUES (source.k, source.n, source.v)"));

        let sqlite = SqlDialect::Sqlite
            .insert_if_absent("insert", "`t`", row("a", "1"), &["k"])
            .unwrap();
        assert!(sqlite.sql.ends_with("ON CONFLICT (k) DO NOTHING RETURNING 1 AS inserted"));
    }

    #[test]
    fn test_rows_must_share_layout() {
        let mismatched = vec![row("a", "1"), vec![ColumnValue::string("k", "b")]];
        assert!(SqlDialect::Sqlite
            .upsert("upsert", "`t`", &mismatched, &["k"], &["v"])
            .is_err());
        assert!(SqlDialect::Sqlite.upsert("upsert", "`t`", &[], &["k"], &["v"]).is_err());
    }

    #[test]
    fn test_inserted_rows_reads_merge_metrics() {
        let metrics = ResultSet::new(
            vec!["num_affected_rows".into(), "num_inserted_rows".into()],
            vec![vec![Some("0".into()), Some("0".into())]],
        );
        assert_eq!(SqlDialect::Databricks.inserted_rows(&metrics).unwrap(), 0);

        let affected_only = ResultSet::new(
            vec!["num_affected_rows".into()],
            vec![vec![Some("1".into())]],
        );
        assert_eq!(SqlDialect::Databricks.inserted_rows(&affected_only).unwrap(), 1);
        assert!(SqlDialect::Databricks.inserted_rows(&ResultSet::empty()).is_err());
    }

    #[test]
    fn test_inserted_rows_counts_returning_rows() {
        let returned = ResultSet::new(vec!["inserted".into()], vec![vec![Some("1".into())]]);
        assert_eq!(SqlDialect::Sqlite.inserted_rows(&returned).unwrap(), 1);
        assert_eq!(SqlDialect::Sqlite.inserted_rows(&ResultSet::empty()).unwrap(), 0);
    }
}
