//! Common test utilities and setup

#![allow(dead_code)]

use std::sync::Arc;
use tempfile::NamedTempFile;
use warehouse_checkpoint::config::TableConfig;
use warehouse_checkpoint::warehouse::{SqlDialect, SqliteWarehouse};
use warehouse_checkpoint::{WarehouseCheckpointSaver, WarehouseClient, WarehouseStore};

/// Create an in-memory SQLite warehouse with the default tables
pub async fn setup_warehouse() -> Arc<dyn WarehouseClient> {
    let warehouse = SqliteWarehouse::in_memory()
        .await
        .expect("Failed to open in-memory warehouse");
    create_tables(&warehouse).await;
    Arc::new(warehouse)
}

/// Create a file-backed SQLite warehouse; keep the temp file alive for the test
pub async fn setup_file_warehouse() -> (NamedTempFile, SqliteWarehouse) {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    let url = format!("sqlite:{}", temp_file.path().display());
    let warehouse = SqliteWarehouse::connect(&url)
        .await
        .expect("Failed to open file warehouse");
    create_tables(&warehouse).await;
    (temp_file, warehouse)
}

async fn create_tables(warehouse: &SqliteWarehouse) {
    let tables = TableConfig::default()
        .resolve(SqlDialect::Sqlite)
        .expect("Default table config resolves");
    warehouse
        .create_tables(&tables)
        .await
        .expect("Failed to create tables");
}

pub async fn setup_saver() -> WarehouseCheckpointSaver {
    WarehouseCheckpointSaver::from_shared(setup_warehouse().await, &TableConfig::default())
        .expect("Failed to create saver")
}

pub async fn setup_store() -> WarehouseStore {
    WarehouseStore::from_shared(setup_warehouse().await, &TableConfig::default())
        .expect("Failed to create store")
}
