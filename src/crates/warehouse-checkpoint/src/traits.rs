//! The checkpoint persistence protocol consumed by a graph execution runtime
//!
//! [`CheckpointSaver`] is the runtime's only persistence boundary for thread state.
//! A runtime drives it once per execution step:
//!
//! ```text
//! step n:   get_tuple(thread)            -> resume from latest (or an explicit id)
//!           put_writes(cp_n, writes, t)  -> each task records its channel writes
//!           put(cp_n, cp_n+1, metadata)  -> the next snapshot, parent = cp_n
//! ```
//!
//! Nothing in the protocol relies on transactions. Each call is independently
//! meaningful: a checkpoint without writes is valid, writes may arrive before
//! their checkpoint, and replaying a `put_writes` is harmless.
//!
//! # Absence
//!
//! A missing checkpoint is `Ok(None)` from [`get_tuple`](CheckpointSaver::get_tuple)
//! and an empty stream from [`list`](CheckpointSaver::list), never an error.
//!
//! # Example
//!
//! ```rust,no_run
//! use warehouse_checkpoint::{
//!     Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
//! };
//! use std::collections::HashMap;
//!
//! async fn step<S: CheckpointSaver>(saver: &S) -> warehouse_checkpoint::Result<()> {
//!     let thread = CheckpointConfig::for_thread("conversation-1");
//!     let resumed = saver.get_tuple(&thread).await?;
//!
//!     let address = resumed.map(|t| t.config).unwrap_or(thread);
//!     let metadata = CheckpointMetadata::new().with_source(CheckpointSource::Loop).with_step(1);
//!     saver.put(&address, Checkpoint::empty(), metadata, HashMap::new()).await?;
//!     Ok(())
//! }
//! ```

use crate::checkpoint::{
    ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata,
    CheckpointTuple,
};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// Stream of checkpoint tuples returned by [`CheckpointSaver::list`]
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send>>;

/// Storage backend for checkpoints and their pending writes
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch just the checkpoint at `config`
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|tuple| tuple.checkpoint))
    }

    /// Fetch the checkpoint at `config` joined with its metadata, parent and writes
    ///
    /// Without `checkpoint_id` this is the latest checkpoint of the thread and
    /// namespace: the one with the lexically greatest id.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// Checkpoints matching the criteria, most recent id first
    ///
    /// - `config` - thread and optionally namespace to list; `None` lists every thread
    /// - `filter` - exact match on top-level metadata keys
    /// - `before` - only checkpoints whose id is lexically below `before.checkpoint_id`
    /// - `limit` - maximum number of tuples
    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Store a new checkpoint as a child of `config.checkpoint_id` (if any)
    ///
    /// Returns the address of the stored checkpoint. Fails with
    /// [`Conflict`](crate::WarehouseError::Conflict) when a different checkpoint
    /// with the same identity already exists.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Record `(channel, value)` writes of `task_id` against the checkpoint at `config`
    ///
    /// Idempotent per `(task_id, write index)`: a replay overwrites, never duplicates.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: String,
    ) -> Result<()>;

    /// Remove every checkpoint and write of a thread, in all namespaces
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    /// Version to assign to a channel after `current`
    fn get_next_version(&self, current: Option<&ChannelVersion>) -> ChannelVersion {
        match current {
            Some(version) => version.next(),
            None => ChannelVersion::Int(1),
        }
    }
}
