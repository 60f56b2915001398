//! Table configuration and environment loading
//!
//! Table identifiers are fixed per saver/store instance: a [`TableConfig`] is
//! validated and quoted once into [`TableNames`], which is then shared read-only by
//! every repository built from it.
//!
//! # Example
//!
//! ```rust
//! use warehouse_checkpoint::config::TableConfig;
//! use warehouse_checkpoint::warehouse::SqlDialect;
//!
//! let tables = TableConfig::new("main", "agents")
//!     .with_store_table("memories")
//!     .resolve(SqlDialect::Databricks)
//!     .unwrap();
//!
//! assert_eq!(tables.checkpoints, "`main`.`agents`.`checkpoints`");
//! assert_eq!(tables.store, "`main`.`agents`.`memories`");
//! ```

use crate::error::{Result, WarehouseError};
use crate::warehouse::SqlDialect;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Default environment prefix for table configuration
pub const DEFAULT_ENV_PREFIX: &str = "UC_";

/// Trait for configuration structures that support validation, env loading and merging
pub trait ConfigBuilder: Default + Clone {
    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Load configuration from environment variables named `{prefix}{FIELD}`
    fn from_env(prefix: &str) -> Result<Self>;

    /// Merge another configuration into this one; set fields of `other` win
    fn merge(&mut self, other: Self) -> &mut Self;

    /// Load from the environment on top of the defaults, then validate
    fn from_env_with_defaults(prefix: &str) -> Result<Self> {
        let mut config = Self::default();
        config.merge(Self::from_env(prefix)?);
        config.validate()?;
        Ok(config)
    }
}

/// Catalog, schema and table names for the three persisted tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub catalog: String,
    pub schema: String,
    pub checkpoints_table: String,
    pub writes_table: String,
    pub store_table: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            catalog: "main".to_string(),
            schema: "langgraph".to_string(),
            checkpoints_table: "checkpoints".to_string(),
            writes_table: "checkpoint_writes".to_string(),
            store_table: "store".to_string(),
        }
    }
}

impl TableConfig {
    /// Create a configuration for the given catalog and schema with default table names
    pub fn new(catalog: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            catalog: catalog.into(),
            schema: schema.into(),
            ..Self::default()
        }
    }

    /// Override the checkpoints table name
    pub fn with_checkpoints_table(mut self, table: impl Into<String>) -> Self {
        self.checkpoints_table = table.into();
        self
    }

    /// Override the pending writes table name
    pub fn with_writes_table(mut self, table: impl Into<String>) -> Self {
        self.writes_table = table.into();
        self
    }

    /// Override the store table name
    pub fn with_store_table(mut self, table: impl Into<String>) -> Self {
        self.store_table = table.into();
        self
    }

    /// Validate and quote every identifier for the given dialect
    pub fn resolve(&self, dialect: SqlDialect) -> Result<TableNames> {
        self.validate()?;
        let qualify = |table: &str| match dialect {
            SqlDialect::Databricks => format!(
                "{}.{}.{}",
                quote_identifier(&self.catalog),
                quote_identifier(&self.schema),
                quote_identifier(table)
            ),
            // SQLite has no catalog layer; tables are addressed by name only
            SqlDialect::Sqlite => quote_identifier(table),
        };

        Ok(TableNames {
            dialect,
            checkpoints: qualify(&self.checkpoints_table),
            writes: qualify(&self.writes_table),
            store: qualify(&self.store_table),
        })
    }
}

impl ConfigBuilder for TableConfig {
    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("catalog", &self.catalog),
            ("schema", &self.schema),
            ("checkpoints_table", &self.checkpoints_table),
            ("writes_table", &self.writes_table),
            ("store_table", &self.store_table),
        ] {
            validate_identifier(field, value)?;
        }
        Ok(())
    }

    fn from_env(prefix: &str) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            catalog: get_env_or(&build_env_key(prefix, "catalog"), defaults.catalog)?,
            schema: get_env_or(&build_env_key(prefix, "schema"), defaults.schema)?,
            checkpoints_table: get_env_or(
                &build_env_key(prefix, "checkpoints_table"),
                defaults.checkpoints_table,
            )?,
            writes_table: get_env_or(&build_env_key(prefix, "writes_table"), defaults.writes_table)?,
            store_table: get_env_or(&build_env_key(prefix, "store_table"), defaults.store_table)?,
        })
    }

    fn merge(&mut self, other: Self) -> &mut Self {
        let fields = [
            (&mut self.catalog, other.catalog),
            (&mut self.schema, other.schema),
            (&mut self.checkpoints_table, other.checkpoints_table),
            (&mut self.writes_table, other.writes_table),
            (&mut self.store_table, other.store_table),
        ];
        for (target, value) in fields {
            if !value.is_empty() {
                *target = value;
            }
        }
        self
    }
}

/// Fully qualified, quoted table identifiers bound to one dialect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub dialect: SqlDialect,
    pub checkpoints: String,
    pub writes: String,
    pub store: String,
}

fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(WarehouseError::Config(format!("{} must not be empty", field)));
    }
    if value.contains('`') || value.contains('\0') {
        return Err(WarehouseError::Config(format!(
            "{} contains an unsupported character: {:?}",
            field, value
        )));
    }
    Ok(())
}

/// Quote an identifier with backticks
///
/// Callers validate first; backticks are never present in a validated identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name)
}

/// Load an environment variable as a string, `None` if unset
pub fn get_env(key: &str) -> Result<Option<String>> {
    match env::var(key) {
        Ok(val) => Ok(Some(val)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(WarehouseError::Config(format!(
            "Environment variable {} contains invalid UTF-8",
            key
        ))),
    }
}

/// Load a required environment variable
pub fn require_env(key: &str) -> Result<String> {
    get_env(key)?.ok_or_else(|| {
        WarehouseError::Config(format!("Environment variable {} is not set", key))
    })
}

/// Load an environment variable with a default value
pub fn get_env_or(key: &str, default: impl Into<String>) -> Result<String> {
    Ok(get_env(key)?.unwrap_or_else(|| default.into()))
}

/// Load and parse an environment variable with a default value
pub fn get_env_parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_env(key)? {
        Some(val) => val.parse::<T>().map_err(|e| {
            WarehouseError::Config(format!("Failed to parse environment variable {}: {}", key, e))
        }),
        None => Ok(default),
    }
}

/// Build a prefixed environment variable name, e.g. `("UC_", "schema")` → `UC_SCHEMA`
pub fn build_env_key(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_names() {
        let config = TableConfig::default();
        assert_eq!(config.checkpoints_table, "checkpoints");
        assert_eq!(config.writes_table, "checkpoint_writes");
        assert_eq!(config.store_table, "store");
    }

    #[test]
    fn test_resolve_databricks_qualifies_with_catalog_and_schema() {
        let tables = TableConfig::new("test_catalog", "test_schema")
            .resolve(SqlDialect::Databricks)
            .unwrap();
        assert_eq!(tables.checkpoints, "`test_catalog`.`test_schema`.`checkpoints`");
        assert_eq!(tables.writes, "`test_catalog`.`test_schema`.`checkpoint_writes`");
        assert_eq!(tables.store, "`test_catalog`.`test_schema`.`store`");
    }

    #[test]
    fn test_resolve_sqlite_uses_bare_table_names() {
        let tables = TableConfig::new("c", "s")
            .with_writes_table("writes")
            .resolve(SqlDialect::Sqlite)
            .unwrap();
        assert_eq!(tables.checkpoints, "`checkpoints`");
        assert_eq!(tables.writes, "`writes`");
    }

    #[test]
    fn test_rejects_backtick_in_identifier() {
        let err = TableConfig::new("main", "bad`schema")
            .resolve(SqlDialect::Databricks)
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Config(_)));
    }

    #[test]
    fn test_rejects_empty_identifier() {
        let config = TableConfig::new("", "schema");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_keeps_existing_values_for_empty_fields() {
        let mut base = TableConfig::new("main", "agents");
        let mut other = TableConfig::new("", "");
        other.store_table = "memories".to_string();
        other.checkpoints_table = String::new();
        base.merge(other);

        assert_eq!(base.catalog, "main");
        assert_eq!(base.schema, "agents");
        assert_eq!(base.checkpoints_table, "checkpoints");
        assert_eq!(base.store_table, "memories");
    }

    #[test]
    fn test_from_env_reads_prefixed_variables() {
        env::set_var("WHCP_TEST_CATALOG", "env_catalog");
        env::set_var("WHCP_TEST_STORE_TABLE", "env_store");
        let config = TableConfig::from_env_with_defaults("WHCP_TEST_").unwrap();
        env::remove_var("WHCP_TEST_CATALOG");
        env::remove_var("WHCP_TEST_STORE_TABLE");

        assert_eq!(config.catalog, "env_catalog");
        assert_eq!(config.schema, "langgraph");
        assert_eq!(config.store_table, "env_store");
    }

    #[test]
    fn test_get_env_parse_or() {
        let missing: u64 = get_env_parse_or("WHCP_TEST_MISSING_VAR_12345", 7).unwrap();
        assert_eq!(missing, 7);

        env::set_var("WHCP_TEST_BAD_NUMBER", "seven");
        let result: Result<u64> = get_env_parse_or("WHCP_TEST_BAD_NUMBER", 7);
        env::remove_var("WHCP_TEST_BAD_NUMBER");
        assert!(result.is_err());
    }

    #[test]
    fn test_build_env_key() {
        assert_eq!(build_env_key("UC_", "catalog"), "UC_CATALOG");
    }
}
