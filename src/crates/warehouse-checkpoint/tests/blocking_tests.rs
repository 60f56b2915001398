//! Blocking entry points driven from plain threads

mod common;

use serde_json::json;
use std::collections::HashMap;
use warehouse_checkpoint::config::TableConfig;
use warehouse_checkpoint::store::{SearchQuery, WarehouseStore};
use warehouse_checkpoint::{
    BlockingCheckpointSaver, BlockingStore, Checkpoint, CheckpointConfig, CheckpointMetadata,
    WarehouseCheckpointSaver,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn test_blocking_saver_round_trip() {
    let runtime = runtime();
    let warehouse = runtime.block_on(common::setup_warehouse());
    let saver = BlockingCheckpointSaver::with_runtime(
        WarehouseCheckpointSaver::from_shared(warehouse, &TableConfig::default()).unwrap(),
        runtime,
    );

    let thread = CheckpointConfig::for_thread("t1");
    let a = saver
        .put(&thread, Checkpoint::empty().with_id("a"), CheckpointMetadata::new(), HashMap::new())
        .unwrap();
    let b = saver
        .put(&a, Checkpoint::empty().with_id("b"), CheckpointMetadata::new(), HashMap::new())
        .unwrap();
    saver
        .put_writes(&b, vec![("messages".to_string(), json!("hi"))], "task".to_string())
        .unwrap();

    let latest = saver.get_tuple(&thread).unwrap().unwrap();
    assert_eq!(latest.checkpoint.id, "b");
    assert_eq!(latest.parent_checkpoint_id(), Some("a"));
    assert_eq!(latest.pending_writes.len(), 1);

    let ids: Vec<String> = saver
        .list(Some(&thread), None, None, None)
        .unwrap()
        .into_iter()
        .map(|tuple| tuple.checkpoint.id)
        .collect();
    assert_eq!(ids, vec!["b", "a"]);

    saver.delete_thread("t1").unwrap();
    assert!(saver.get(&thread).unwrap().is_none());
}

#[test]
fn test_blocking_store_through_handle() {
    let runtime = runtime();
    let warehouse = runtime.block_on(common::setup_warehouse());
    let store = BlockingStore::with_handle(
        WarehouseStore::from_shared(warehouse, &TableConfig::default()).unwrap(),
        runtime.handle().clone(),
    );

    store.put(&["a", "b"], "k", json!({"n": 1})).unwrap();
    store.put(&["b"], "k", json!({"n": 2})).unwrap();

    assert_eq!(store.get(&["a", "b"], "k").unwrap().unwrap().value, json!({"n": 1}));
    assert_eq!(store.search(&["a"], SearchQuery::new()).unwrap().len(), 1);

    store.delete(&["a", "b"], "k").unwrap();
    assert!(store.get(&["a", "b"], "k").unwrap().is_none());
}
