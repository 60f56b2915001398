//! Warehouse-backed [`CheckpointSaver`]
//!
//! Combines a [`CheckpointRepository`] with a [`SerializerProtocol`]. The saver
//! holds no state between calls beyond its configuration; every tuple is rebuilt
//! from the checkpoint row plus its pending write rows.
//!
//! # Example
//!
//! ```rust,no_run
//! use warehouse_checkpoint::config::TableConfig;
//! use warehouse_checkpoint::warehouse::{DatabricksConfig, DatabricksWarehouse, RetryPolicy, RetryingWarehouse};
//! use warehouse_checkpoint::{CheckpointConfig, CheckpointSaver, WarehouseCheckpointSaver};
//!
//! # async fn example() -> warehouse_checkpoint::Result<()> {
//! let warehouse = RetryingWarehouse::new(
//!     DatabricksWarehouse::new(DatabricksConfig::from_env()?)?,
//!     RetryPolicy::default(),
//! );
//! let saver = WarehouseCheckpointSaver::new(warehouse, &TableConfig::new("main", "agents"))?;
//!
//! if let Some(tuple) = saver.get_tuple(&CheckpointConfig::for_thread("conversation-1")).await? {
//!     println!("resuming from {}", tuple.checkpoint.id);
//! }
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::{
    validate_versions, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata,
    CheckpointTuple, PendingWrite, WriteKind,
};
use crate::config::TableConfig;
use crate::error::{Result, WarehouseError};
use crate::repository::{CheckpointRepository, CheckpointRow, ListQuery, WriteRow};
use crate::serializer::{SerializerProtocol, TaggedSerializer};
use crate::traits::{CheckpointSaver, CheckpointStream};
use crate::warehouse::WarehouseClient;
use async_trait::async_trait;
use futures::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Rows fetched per listing round trip
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Checkpoint saver persisting to a SQL warehouse
pub struct WarehouseCheckpointSaver<S = TaggedSerializer> {
    repo: CheckpointRepository,
    serializer: Arc<S>,
    page_size: usize,
}

impl<S> Clone for WarehouseCheckpointSaver<S> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            serializer: self.serializer.clone(),
            page_size: self.page_size,
        }
    }
}

impl<S> std::fmt::Debug for WarehouseCheckpointSaver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseCheckpointSaver")
            .field("repo", &self.repo)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl WarehouseCheckpointSaver<TaggedSerializer> {
    /// Create a saver for the tables named by `tables`
    ///
    /// Table identifiers are validated and quoted here, once.
    pub fn new(client: impl WarehouseClient + 'static, tables: &TableConfig) -> Result<Self> {
        Self::from_shared(Arc::new(client), tables)
    }

    /// Create a saver sharing a client with other savers or stores
    pub fn from_shared(client: Arc<dyn WarehouseClient>, tables: &TableConfig) -> Result<Self> {
        let names = Arc::new(tables.resolve(client.dialect())?);
        Ok(Self {
            repo: CheckpointRepository::new(client, names),
            serializer: Arc::new(TaggedSerializer::new()),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }
}

impl<S: SerializerProtocol + 'static> WarehouseCheckpointSaver<S> {
    /// Replace the serializer used for checkpoint payloads and write values
    pub fn with_serializer<T: SerializerProtocol + 'static>(self, serializer: T) -> WarehouseCheckpointSaver<T> {
        WarehouseCheckpointSaver {
            repo: self.repo,
            serializer: Arc::new(serializer),
            page_size: self.page_size,
        }
    }

    /// Rows fetched per listing round trip
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn encode_row(
        &self,
        config: &CheckpointConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
    ) -> Result<CheckpointRow> {
        Ok(CheckpointRow {
            thread_id: config.require_thread_id()?.to_string(),
            checkpoint_ns: config.ns().to_string(),
            checkpoint_id: checkpoint.id.clone(),
            parent_checkpoint_id: config.checkpoint_id.clone(),
            checkpoint: self.serializer.dumps_typed(checkpoint)?,
            metadata: serde_json::to_string(metadata)?,
        })
    }

    /// Whether a stored row holds exactly what `put` was about to write
    ///
    /// Compared after decoding, since map ordering makes the encoded text unstable.
    fn is_same_checkpoint(
        &self,
        stored: &CheckpointRow,
        row: &CheckpointRow,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
    ) -> Result<bool> {
        if stored.parent_checkpoint_id != row.parent_checkpoint_id || stored.checkpoint.tag != row.checkpoint.tag {
            return Ok(false);
        }
        let stored_checkpoint: Checkpoint = self.serializer.loads_typed(&stored.checkpoint)?;
        let stored_metadata: CheckpointMetadata = serde_json::from_str(&stored.metadata)?;
        Ok(&stored_checkpoint == checkpoint && &stored_metadata == metadata)
    }
}

fn row_config(row: &CheckpointRow) -> CheckpointConfig {
    CheckpointConfig::for_thread(row.thread_id.clone())
        .with_checkpoint_ns(row.checkpoint_ns.clone())
        .with_checkpoint_id(row.checkpoint_id.clone())
}

fn decode_tuple<S: SerializerProtocol>(
    serializer: &S,
    row: CheckpointRow,
    metadata: CheckpointMetadata,
    writes: Vec<WriteRow>,
) -> Result<CheckpointTuple> {
    let checkpoint: Checkpoint = serializer.loads_typed(&row.checkpoint)?;
    let pending_writes = writes
        .into_iter()
        .map(|write| -> Result<PendingWrite> {
            let value = serializer.loads_typed(&write.value)?;
            Ok((write.task_id, write.channel, value))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut tuple = CheckpointTuple::new(row_config(&row), checkpoint, metadata)
        .with_pending_writes(pending_writes);
    if let Some(parent_id) = row.parent_checkpoint_id {
        tuple = tuple.with_parent_config(
            CheckpointConfig::for_thread(row.thread_id)
                .with_checkpoint_ns(row.checkpoint_ns)
                .with_checkpoint_id(parent_id),
        );
    }
    Ok(tuple)
}

#[async_trait]
impl<S: SerializerProtocol + 'static> CheckpointSaver for WarehouseCheckpointSaver<S> {
    #[tracing::instrument(skip(self), fields(thread_id = ?config.thread_id, checkpoint_id = ?config.checkpoint_id))]
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let thread_id = config.require_thread_id()?;
        let checkpoint_ns = config.ns();

        let Some(row) = self
            .repo
            .get_checkpoint(thread_id, checkpoint_ns, config.checkpoint_id.as_deref())
            .await?
        else {
            debug!("No checkpoint found");
            return Ok(None);
        };

        let writes = self
            .repo
            .get_writes(thread_id, checkpoint_ns, &row.checkpoint_id)
            .await?;
        let metadata: CheckpointMetadata = serde_json::from_str(&row.metadata)?;
        decode_tuple(self.serializer.as_ref(), row, metadata, writes).map(Some)
    }

    #[tracing::instrument(skip(self, config, filter, before))]
    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let filter = filter.unwrap_or_default();
        let page_size = match limit {
            Some(limit) if filter.is_empty() => limit.clamp(1, self.page_size),
            _ => self.page_size,
        };

        let state = ListState {
            repo: self.repo.clone(),
            serializer: self.serializer.clone(),
            query: ListQuery {
                thread_id: config.and_then(|c| c.thread_id.clone()),
                checkpoint_ns: config.and_then(|c| c.checkpoint_ns.clone()),
                before: before.and_then(|b| b.checkpoint_id.clone()),
                after_row: None,
                page_size,
            },
            filter,
            remaining: limit,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        let tuples = stream::try_unfold(state, ListState::next);
        Ok(Box::pin(tuples))
    }

    #[tracing::instrument(
        skip(self, config, checkpoint, metadata, new_versions),
        fields(thread_id = ?config.thread_id, checkpoint_id = %checkpoint.id)
    )]
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        checkpoint.validate_versions()?;
        validate_versions(&new_versions)?;
        let row = self.encode_row(config, &checkpoint, &metadata)?;
        debug!(
            parent = ?row.parent_checkpoint_id,
            new_versions = new_versions.len(),
            "Storing checkpoint"
        );

        match self.repo.insert_checkpoint(&row).await {
            Ok(()) => {}
            Err(conflict @ WarehouseError::Conflict { .. }) => {
                // A retried statement may have committed on an earlier attempt
                let stored = self
                    .repo
                    .get_checkpoint(&row.thread_id, &row.checkpoint_ns, Some(&row.checkpoint_id))
                    .await?;
                let applied = match &stored {
                    Some(stored) => self.is_same_checkpoint(stored, &row, &checkpoint, &metadata)?,
                    None => false,
                };
                if !applied {
                    warn!("Checkpoint id already taken by a different checkpoint");
                    return Err(conflict);
                }
                debug!("Identical checkpoint already stored, treating put as applied");
            }
            Err(err) => return Err(err),
        }

        Ok(row_config(&row))
    }

    #[tracing::instrument(
        skip(self, config, writes),
        fields(thread_id = ?config.thread_id, checkpoint_id = ?config.checkpoint_id, writes = writes.len())
    )]
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: String,
    ) -> Result<()> {
        let thread_id = config.require_thread_id()?;
        let checkpoint_id = config.require_checkpoint_id()?;

        let rows = writes
            .iter()
            .enumerate()
            .map(|(position, (channel, value))| -> Result<WriteRow> {
                let kind = WriteKind::for_channel(channel);
                Ok(WriteRow {
                    thread_id: thread_id.to_string(),
                    checkpoint_ns: config.ns().to_string(),
                    checkpoint_id: checkpoint_id.to_string(),
                    task_id: task_id.clone(),
                    idx: kind.reserved_index().unwrap_or(position as i64),
                    channel: channel.clone(),
                    value: self.serializer.dumps_typed(value)?,
                    write_type: kind,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.repo.insert_pending_writes(&rows).await
    }

    #[tracing::instrument(skip(self))]
    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.repo.delete_thread(thread_id).await
    }
}

/// Paging state behind the stream returned by `list`
struct ListState<S> {
    repo: CheckpointRepository,
    serializer: Arc<S>,
    query: ListQuery,
    filter: HashMap<String, serde_json::Value>,
    remaining: Option<usize>,
    buffer: VecDeque<CheckpointTuple>,
    exhausted: bool,
}

impl<S: SerializerProtocol> ListState<S> {
    async fn next(mut self) -> Result<Option<(CheckpointTuple, Self)>> {
        loop {
            if self.remaining == Some(0) {
                return Ok(None);
            }
            if let Some(tuple) = self.buffer.pop_front() {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Ok(Some((tuple, self)));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    /// Fetch the next page, keep rows passing the metadata filter, and buffer their tuples
    async fn fetch_page(&mut self) -> Result<()> {
        let rows = self.repo.list_checkpoints(&self.query).await?;
        match rows.last() {
            Some(last) if rows.len() >= self.query.page_size => {
                self.query.after_row = Some((
                    last.thread_id.clone(),
                    last.checkpoint_ns.clone(),
                    last.checkpoint_id.clone(),
                ));
            }
            _ => self.exhausted = true,
        }

        let mut matching = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata: CheckpointMetadata = serde_json::from_str(&row.metadata)?;
            if metadata.matches(&self.filter) {
                matching.push((row, metadata));
            }
        }
        if let Some(remaining) = self.remaining {
            matching.truncate(remaining);
        }

        let page: Vec<CheckpointRow> = matching.iter().map(|(row, _)| row.clone()).collect();
        let mut writes = self.repo.get_writes_for(&page).await?;
        for (row, metadata) in matching {
            let key = (
                row.thread_id.clone(),
                row.checkpoint_ns.clone(),
                row.checkpoint_id.clone(),
            );
            let row_writes = writes.remove(&key).unwrap_or_default();
            self.buffer
                .push_back(decode_tuple(self.serializer.as_ref(), row, metadata, row_writes)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointSource, ERROR};
    use crate::test_support::{sqlite_client, RecordingWarehouse};
    use crate::warehouse::{ResultSet, SqlDialect};
    use futures::TryStreamExt;
    use serde_json::json;

    async fn saver() -> WarehouseCheckpointSaver {
        WarehouseCheckpointSaver::from_shared(sqlite_client().await, &TableConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_put_links_parent_and_returns_address() {
        let saver = saver().await;
        let first = Checkpoint::empty().with_id("a");
        let address = saver
            .put(&CheckpointConfig::for_thread("t1"), first, CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(address.checkpoint_id.as_deref(), Some("a"));
        assert_eq!(address.ns(), "");

        saver
            .put(&address, Checkpoint::empty().with_id("b"), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        let latest = saver.get_tuple(&CheckpointConfig::for_thread("t1")).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint.id, "b");
        assert_eq!(latest.parent_checkpoint_id(), Some("a"));
    }

    #[tokio::test]
    async fn test_replayed_put_is_applied_once() {
        let saver = saver().await;
        let checkpoint = Checkpoint::empty()
            .with_id("a")
            .with_channel_value("messages", json!(["hi"]))
            .with_channel_value("count", json!(1));
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Input)
            .with_extra("user".to_string(), json!("alice"))
            .with_extra("tags".to_string(), json!(["x"]));
        let config = CheckpointConfig::for_thread("t1");

        saver
            .put(&config, checkpoint.clone(), metadata.clone(), HashMap::new())
            .await
            .unwrap();
        let replay = saver
            .put(&config, checkpoint.clone(), metadata.clone(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(replay.checkpoint_id.as_deref(), Some("a"));

        let different = checkpoint.with_channel_value("count", json!(2));
        let err = saver
            .put(&config, different, metadata, HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_special_channels_use_reserved_indices() {
        let recorder = Arc::new(RecordingWarehouse::new(SqlDialect::Databricks));
        recorder.push_result(ResultSet::empty());
        let saver = WarehouseCheckpointSaver::from_shared(recorder.clone(), &TableConfig::default()).unwrap();

        let config = CheckpointConfig::for_thread("t1").with_checkpoint_id("a".to_string());
        saver
            .put_writes(
                &config,
                vec![
                    ("messages".to_string(), json!("one")),
                    (ERROR.to_string(), json!({"message": "boom"})),
                    ("messages".to_string(), json!("two")),
                ],
                "task-1".to_string(),
            )
            .await
            .unwrap();

        let statements = recorder.statements();
        assert_eq!(statements.len(), 1);
        let statement = &statements[0];
        assert!(statement.sql.contains("WHEN MATCHED THEN UPDATE SET"));

        let idx: Vec<Option<String>> = (0..3)
            .map(|i| statement.parameter(&format!("idx_{}", i)).unwrap().value.clone())
            .collect();
        let kinds: Vec<Option<String>> = (0..3)
            .map(|i| statement.parameter(&format!("write_type_{}", i)).unwrap().value.clone())
            .collect();
        // rows are ordered by identity, so the reserved -1 slot sorts first
        assert_eq!(idx, vec![Some("-1".into()), Some("0".into()), Some("2".into())]);
        assert_eq!(kinds[0].as_deref(), Some("error"));
        assert_eq!(kinds[1].as_deref(), Some("channel"));
    }

    #[tokio::test]
    async fn test_put_writes_requires_checkpoint_id() {
        let saver = saver().await;
        let err = saver
            .put_writes(&CheckpointConfig::for_thread("t1"), vec![], "task".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_list_applies_filter_across_pages() {
        let saver = saver().await.with_page_size(2);
        for (i, id) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let metadata = CheckpointMetadata::new().with_step(i as i32 % 2);
            saver
                .put(
                    &CheckpointConfig::for_thread("t1"),
                    Checkpoint::empty().with_id(*id),
                    metadata,
                    HashMap::new(),
                )
                .await
                .unwrap();
        }

        let mut filter = HashMap::new();
        filter.insert("step".to_string(), json!(0));
        let ids: Vec<String> = saver
            .list(Some(&CheckpointConfig::for_thread("t1")), Some(filter), None, Some(2))
            .await
            .unwrap()
            .map_ok(|tuple| tuple.checkpoint.id)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids, vec!["e", "c"]);
    }
}
