//! # warehouse-checkpoint - Graph State Persistence on a SQL Warehouse
//!
//! Checkpoint saver and hierarchical key-value store for a resumable graph
//! execution runtime, persisted through a SQL warehouse that offers a single
//! capability: execute one statement and return rows of text.
//!
//! ## Overview
//!
//! - [`WarehouseCheckpointSaver`] implements [`CheckpointSaver`]: it records one
//!   [`Checkpoint`] per execution step, the [`PendingWrite`]s proposed during that
//!   step, and resolves "latest checkpoint of a thread" for resumption.
//! - [`WarehouseStore`] implements [`Store`]: long-lived memory addressed by a
//!   namespace path and key, with prefix search and namespace enumeration.
//! - [`warehouse`] holds the statement adapter and its backends: the Databricks
//!   SQL Statement Execution API and a local SQLite database.
//!
//! There are no transactions anywhere. Each row is independently meaningful and
//! keyed by identity: checkpoints are append-only (a repeated id is a
//! [`WarehouseError::Conflict`]), pending writes are upserts, and a checkpoint whose
//! writes never arrived is still a valid checkpoint.
//!
//! ## Tables
//!
//! | Table               | Key                                                      |
//! |---------------------|----------------------------------------------------------|
//! | `checkpoints`       | `thread_id, checkpoint_ns, checkpoint_id`                |
//! | `checkpoint_writes` | `thread_id, checkpoint_ns, checkpoint_id, task_id, idx`  |
//! | `store`             | `prefix, key`                                            |
//!
//! Table names, catalog and schema come from [`TableConfig`]. Provisioning the
//! tables is left to the deployment.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use warehouse_checkpoint::config::TableConfig;
//! use warehouse_checkpoint::warehouse::{DatabricksConfig, DatabricksWarehouse, RetryPolicy, RetryingWarehouse};
//! use warehouse_checkpoint::{
//!     Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, WarehouseCheckpointSaver,
//! };
//!
//! # async fn example() -> warehouse_checkpoint::Result<()> {
//! let warehouse = RetryingWarehouse::new(
//!     DatabricksWarehouse::new(DatabricksConfig::from_env()?)?,
//!     RetryPolicy::default(),
//! );
//! let saver = WarehouseCheckpointSaver::new(warehouse, &TableConfig::new("main", "agents"))?;
//!
//! let thread = CheckpointConfig::for_thread("conversation-1");
//! let address = saver
//!     .put(&thread, Checkpoint::empty(), CheckpointMetadata::new().with_step(-1), HashMap::new())
//!     .await?;
//! saver
//!     .put_writes(&address, vec![("messages".into(), serde_json::json!("hi"))], "task-1".into())
//!     .await?;
//!
//! let latest = saver.get_tuple(&thread).await?.expect("just stored");
//! assert_eq!(latest.pending_writes.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! The crate emits `tracing` events (statements at `debug`, retries at `warn`) and
//! spans for saver and store operations. It never installs a subscriber.

pub mod blocking;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod repository;
pub mod saver;
pub mod serializer;
pub mod store;
pub mod traits;
pub mod warehouse;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types
pub use blocking::{BlockingCheckpointSaver, BlockingStore};
pub use checkpoint::{
    ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointId,
    CheckpointMetadata, CheckpointSource, CheckpointTuple, PendingWrite, WriteKind,
};
pub use config::{TableConfig, TableNames};
pub use error::{Result, WarehouseError};
pub use saver::WarehouseCheckpointSaver;
pub use serializer::{EncodedValue, Encoding, SerializerProtocol, TaggedSerializer};
pub use store::{Item, NamespaceQuery, SearchQuery, Store, WarehouseStore};
pub use traits::{CheckpointSaver, CheckpointStream};
pub use warehouse::{Statement, WarehouseClient};
