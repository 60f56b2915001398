//! Shared fixtures for unit tests

use crate::config::{TableConfig, TableNames};
use crate::error::Result;
use crate::warehouse::{ResultSet, SqlDialect, SqliteWarehouse, Statement, WarehouseClient};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// In-memory SQLite warehouse with the default tables created
pub(crate) async fn sqlite_client() -> Arc<dyn WarehouseClient> {
    sqlite_tables().await.0
}

pub(crate) async fn sqlite_tables() -> (Arc<dyn WarehouseClient>, Arc<TableNames>) {
    let warehouse = SqliteWarehouse::in_memory().await.unwrap();
    let tables = TableConfig::default().resolve(SqlDialect::Sqlite).unwrap();
    warehouse.create_tables(&tables).await.unwrap();
    (Arc::new(warehouse), Arc::new(tables))
}

/// Records every statement and replays queued results (empty when none are queued)
pub(crate) struct RecordingWarehouse {
    dialect: SqlDialect,
    statements: Mutex<Vec<Statement>>,
    results: Mutex<VecDeque<ResultSet>>,
}

impl RecordingWarehouse {
    pub(crate) fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            statements: Mutex::new(Vec::new()),
            results: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push_result(&self, result: ResultSet) {
        self.results.lock().unwrap().push_back(result);
    }

    pub(crate) fn statements(&self) -> Vec<Statement> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl WarehouseClient for RecordingWarehouse {
    fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    async fn execute(&self, statement: &Statement) -> Result<ResultSet> {
        self.statements.lock().unwrap().push(statement.clone());
        Ok(self.results.lock().unwrap().pop_front().unwrap_or_default())
    }
}
