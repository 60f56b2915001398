//! Blocking entry points for callers without an async runtime
//!
//! Each wrapper drives the async implementation on a Tokio runtime it either owns
//! or borrows through a [`Handle`]. Calls block the current thread for one or more
//! warehouse round trips, so do not call them from inside an async task; use the
//! async [`CheckpointSaver`] and [`Store`] traits there instead.
//!
//! ```rust,no_run
//! use warehouse_checkpoint::blocking::BlockingCheckpointSaver;
//! use warehouse_checkpoint::config::TableConfig;
//! use warehouse_checkpoint::warehouse::SqliteWarehouse;
//! use warehouse_checkpoint::{CheckpointConfig, WarehouseCheckpointSaver};
//!
//! # fn main() -> warehouse_checkpoint::Result<()> {
//! let runtime = tokio::runtime::Runtime::new().expect("runtime");
//! let warehouse = runtime.block_on(SqliteWarehouse::connect("sqlite:checkpoints.db"))?;
//! let saver = BlockingCheckpointSaver::with_runtime(
//!     WarehouseCheckpointSaver::new(warehouse, &TableConfig::default())?,
//!     runtime,
//! );
//! let latest = saver.get_tuple(&CheckpointConfig::for_thread("conversation-1"))?;
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
};
use crate::error::{Result, WarehouseError};
use crate::store::{Item, NamespaceQuery, SearchQuery, Store};
use crate::traits::CheckpointSaver;
use futures::TryStreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use tokio::runtime::{Handle, Runtime};

enum Driver {
    Owned(Runtime),
    Borrowed(Handle),
}

impl Driver {
    fn current_thread() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| WarehouseError::Config(format!("Failed to create Tokio runtime: {}", e)))?;
        Ok(Driver::Owned(runtime))
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        match self {
            Driver::Owned(runtime) => runtime.block_on(future),
            Driver::Borrowed(handle) => handle.block_on(future),
        }
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Driver::Owned(_) => f.write_str("Driver::Owned"),
            Driver::Borrowed(_) => f.write_str("Driver::Borrowed"),
        }
    }
}

/// Blocking facade over any [`CheckpointSaver`]
#[derive(Debug)]
pub struct BlockingCheckpointSaver<C> {
    inner: C,
    driver: Driver,
}

impl<C: CheckpointSaver> BlockingCheckpointSaver<C> {
    /// Wrap `inner` with a private current-thread runtime
    pub fn new(inner: C) -> Result<Self> {
        Ok(Self {
            inner,
            driver: Driver::current_thread()?,
        })
    }

    /// Wrap `inner`, driving calls on `runtime`
    pub fn with_runtime(inner: C, runtime: Runtime) -> Self {
        Self {
            inner,
            driver: Driver::Owned(runtime),
        }
    }

    /// Wrap `inner`, driving calls through a handle to a runtime owned elsewhere
    pub fn with_handle(inner: C, handle: Handle) -> Self {
        Self {
            inner,
            driver: Driver::Borrowed(handle),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        self.driver.block_on(self.inner.get(config))
    }

    pub fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        self.driver.block_on(self.inner.get_tuple(config))
    }

    /// Collect the listing eagerly, most recent first
    pub fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>> {
        self.driver.block_on(async {
            self.inner
                .list(config, filter, before, limit)
                .await?
                .try_collect()
                .await
        })
    }

    pub fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        self.driver
            .block_on(self.inner.put(config, checkpoint, metadata, new_versions))
    }

    pub fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: String,
    ) -> Result<()> {
        self.driver
            .block_on(self.inner.put_writes(config, writes, task_id))
    }

    pub fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.driver.block_on(self.inner.delete_thread(thread_id))
    }
}

/// Blocking facade over any [`Store`]
#[derive(Debug)]
pub struct BlockingStore<S> {
    inner: S,
    driver: Driver,
}

impl<S: Store> BlockingStore<S> {
    pub fn new(inner: S) -> Result<Self> {
        Ok(Self {
            inner,
            driver: Driver::current_thread()?,
        })
    }

    pub fn with_runtime(inner: S, runtime: Runtime) -> Self {
        Self {
            inner,
            driver: Driver::Owned(runtime),
        }
    }

    pub fn with_handle(inner: S, handle: Handle) -> Self {
        Self {
            inner,
            driver: Driver::Borrowed(handle),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn put(&self, namespace: &[&str], key: &str, value: Value) -> Result<()> {
        self.driver.block_on(self.inner.put(namespace, key, value))
    }

    pub fn get(&self, namespace: &[&str], key: &str) -> Result<Option<Item>> {
        self.driver.block_on(self.inner.get(namespace, key))
    }

    pub fn delete(&self, namespace: &[&str], key: &str) -> Result<()> {
        self.driver.block_on(self.inner.delete(namespace, key))
    }

    pub fn search(&self, namespace_prefix: &[&str], query: SearchQuery) -> Result<Vec<Item>> {
        self.driver.block_on(self.inner.search(namespace_prefix, query))
    }

    pub fn list_namespaces(&self, query: NamespaceQuery) -> Result<Vec<Vec<String>>> {
        self.driver.block_on(self.inner.list_namespaces(query))
    }
}
