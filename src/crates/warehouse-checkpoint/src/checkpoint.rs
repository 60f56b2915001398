//! Core checkpoint data structures
//!
//! This module defines the records the saver persists and returns:
//!
//! - [`Checkpoint`] - Snapshot of channel values and versions at one execution step
//! - [`CheckpointConfig`] - Address of a checkpoint: thread id, namespace and optional id
//! - [`CheckpointMetadata`] - Step number, source, parents and free-form extra keys
//! - [`CheckpointTuple`] - A checkpoint joined with its metadata, parent pointer and pending writes
//! - [`PendingWrite`] - `(task_id, channel, value)` proposed during a step
//! - [`WriteKind`] - Distinguishes plain channel writes from special markers
//!
//! # Addressing
//!
//! A checkpoint is identified by `(thread_id, checkpoint_ns, checkpoint_id)`. The
//! namespace defaults to the empty string (the root graph). Omitting the id
//! addresses the *latest* checkpoint: the one with the lexically greatest id.
//!
//! ```rust
//! use warehouse_checkpoint::CheckpointConfig;
//!
//! // Latest checkpoint of a thread
//! let latest = CheckpointConfig::for_thread("conversation-1");
//!
//! // A specific checkpoint inside a subgraph namespace
//! let exact = CheckpointConfig::for_thread("conversation-1")
//!     .with_checkpoint_ns("tools".to_string())
//!     .with_checkpoint_id("1ef4f797-8335-6428-8001-8a1503f9b875".to_string());
//!
//! assert!(latest.checkpoint_id.is_none());
//! assert_eq!(exact.ns(), "tools");
//! ```
//!
//! # Checkpoint ids
//!
//! [`Checkpoint::empty`] draws ids from UUID v7, which embeds a millisecond timestamp
//! in its most significant bits, so lexical order of the canonical string form
//! follows creation order. Callers that mint their own ids must keep that property.

use crate::error::{Result, WarehouseError};
use crate::store::values_equal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Pending write tuple: (task_id, channel, value)
pub type PendingWrite = (String, String, serde_json::Value);

/// Channel written when a task fails
pub const ERROR: &str = "__error__";
/// Channel recording tasks scheduled for the next step
pub const SCHEDULED: &str = "__scheduled__";
/// Channel recording an interrupt raised by a task
pub const INTERRUPT: &str = "__interrupt__";
/// Channel carrying a resume value for an interrupted task
pub const RESUME: &str = "__resume__";

/// Kind of a pending write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteKind {
    /// Ordinary channel write
    Channel,
    /// The task failed; the value carries the error
    Error,
    /// The task was scheduled for the next step
    Scheduled,
    /// The task raised an interrupt
    Interrupt,
    /// Resume signal for an interrupted task
    Resume,
}

impl WriteKind {
    /// Classify a write by its channel name
    pub fn for_channel(channel: &str) -> Self {
        match channel {
            ERROR => WriteKind::Error,
            SCHEDULED => WriteKind::Scheduled,
            INTERRUPT => WriteKind::Interrupt,
            RESUME => WriteKind::Resume,
            _ => WriteKind::Channel,
        }
    }

    /// Fixed write index for special markers; channel writes use their batch position
    ///
    /// Markers keep one slot per task no matter how often they are re-emitted, so a
    /// retried step overwrites the marker instead of accumulating copies.
    pub fn reserved_index(&self) -> Option<i64> {
        match self {
            WriteKind::Channel => None,
            WriteKind::Error => Some(-1),
            WriteKind::Scheduled => Some(-2),
            WriteKind::Interrupt => Some(-3),
            WriteKind::Resume => Some(-4),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteKind::Channel => "channel",
            WriteKind::Error => "error",
            WriteKind::Scheduled => "scheduled",
            WriteKind::Interrupt => "interrupt",
            WriteKind::Resume => "resume",
        }
    }
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteKind {
    type Err = WarehouseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "channel" => Ok(WriteKind::Channel),
            "error" => Ok(WriteKind::Error),
            "scheduled" => Ok(WriteKind::Scheduled),
            "interrupt" => Ok(WriteKind::Interrupt),
            "resume" => Ok(WriteKind::Resume),
            other => Err(WarehouseError::malformed(format!("unknown write_type {:?}", other))),
        }
    }
}

/// Channel version type - can be int, float, or string
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ChannelVersion {
    Int(i64),
    Float(f64),
    String(String),
}

impl ChannelVersion {
    /// Get the next version
    ///
    /// String versions are expected in the zero-padded `"<counter>.<suffix>"` form;
    /// the counter is incremented and the suffix dropped.
    pub fn next(&self) -> Self {
        match self {
            ChannelVersion::Int(v) => ChannelVersion::Int(v + 1),
            ChannelVersion::Float(v) => ChannelVersion::Float(v + 1.0),
            ChannelVersion::String(s) => {
                let counter = s
                    .split('.')
                    .next()
                    .and_then(|head| head.parse::<u64>().ok())
                    .unwrap_or(0);
                ChannelVersion::String(format!("{:032}", counter + 1))
            }
        }
    }

    /// NaN and infinite float versions serialize to JSON `null` and cannot be read back
    pub fn is_storable(&self) -> bool {
        match self {
            ChannelVersion::Float(v) => v.is_finite(),
            _ => true,
        }
    }
}

/// Mapping from channel name to version
pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// Reject version maps holding a value that cannot be persisted
pub fn validate_versions(versions: &ChannelVersions) -> Result<()> {
    match versions.iter().find(|(_, version)| !version.is_storable()) {
        Some((channel, version)) => Err(WarehouseError::Invalid(format!(
            "channel {:?} has unstorable version {:?}",
            channel, version
        ))),
        None => Ok(()),
    }
}

/// Metadata source type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Checkpoint created from an input to invoke/stream/batch
    Input,
    /// Checkpoint created from inside the pregel loop
    Loop,
    /// Checkpoint created from a manual state update
    Update,
    /// Checkpoint created as a copy of another checkpoint
    Fork,
}

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// The step number of the checkpoint
    /// -1 for the first "input" checkpoint
    /// 0 for the first "loop" checkpoint
    /// n for the nth checkpoint afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i32>,

    /// The IDs of the parent checkpoints
    /// Mapping from checkpoint namespace to checkpoint ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<HashMap<String, String>>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    /// Create a new checkpoint metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source
    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the step number
    pub fn with_step(mut self, step: i32) -> Self {
        self.step = Some(step);
        self
    }

    /// Set parent checkpoints
    pub fn with_parents(mut self, parents: HashMap<String, String>) -> Self {
        self.parents = Some(parents);
        self
    }

    /// Add custom metadata
    pub fn with_extra(mut self, key: String, value: serde_json::Value) -> Self {
        self.extra.insert(key, value);
        self
    }

    /// Exact match of every filter key against the serialized metadata
    ///
    /// Filter keys address top-level fields, so `source`, `step` and `parents` are
    /// matched the same way as extra keys. A key absent from the metadata never matches.
    /// Numbers compare by value, so `1.0` matches a stored `1`.
    pub fn matches(&self, filter: &HashMap<String, serde_json::Value>) -> bool {
        if filter.is_empty() {
            return true;
        }
        let serialized = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return false,
        };
        filter
            .iter()
            .all(|(key, expected)| {
                serialized
                    .get(key)
                    .is_some_and(|actual| values_equal(actual, expected))
            })
    }
}

/// State snapshot at a given point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// The version of the checkpoint format (currently 1)
    pub v: i32,

    /// The ID of the checkpoint (unique and lexically increasing over time)
    pub id: CheckpointId,

    /// The timestamp of the checkpoint
    pub ts: DateTime<Utc>,

    /// Mapping from channel name to channel snapshot value
    pub channel_values: HashMap<String, serde_json::Value>,

    /// The versions of the channels at the time of the checkpoint
    pub channel_versions: ChannelVersions,

    /// Map from node ID to map from channel name to version seen
    pub versions_seen: HashMap<String, ChannelVersions>,

    /// The channels that were updated in this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_channels: Option<Vec<String>>,
}

impl Checkpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: i32 = 1;

    /// Create a new checkpoint
    pub fn new(
        id: CheckpointId,
        channel_values: HashMap<String, serde_json::Value>,
        channel_versions: ChannelVersions,
        versions_seen: HashMap<String, ChannelVersions>,
    ) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id,
            ts: Utc::now(),
            channel_values,
            channel_versions,
            versions_seen,
            updated_channels: None,
        }
    }

    /// Create an empty checkpoint with a fresh time-ordered id
    pub fn empty() -> Self {
        Self::new(
            Uuid::now_v7().to_string(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        )
    }

    /// Replace the id
    pub fn with_id(mut self, id: impl Into<CheckpointId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set a single channel value
    pub fn with_channel_value(mut self, channel: impl Into<String>, value: serde_json::Value) -> Self {
        self.channel_values.insert(channel.into(), value);
        self
    }

    /// Set the updated channels
    pub fn with_updated_channels(mut self, channels: Vec<String>) -> Self {
        self.updated_channels = Some(channels);
        self
    }

    /// Check `channel_versions` and every `versions_seen` entry
    pub fn validate_versions(&self) -> Result<()> {
        validate_versions(&self.channel_versions)?;
        self.versions_seen.values().try_for_each(validate_versions)
    }
}

/// Address of a checkpoint: thread, namespace and (optionally) id
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointConfig {
    /// Thread ID for grouping related checkpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Specific checkpoint ID; `None` addresses the latest checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,

    /// Checkpoint namespace; `None` is the root namespace `""`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,

    /// Additional configuration
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointConfig {
    /// Create a new checkpoint configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the latest checkpoint of a thread in the root namespace
    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self::new().with_thread_id(thread_id.into())
    }

    /// Set the thread ID
    pub fn with_thread_id(mut self, thread_id: String) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    /// Set the checkpoint ID
    pub fn with_checkpoint_id(mut self, checkpoint_id: CheckpointId) -> Self {
        self.checkpoint_id = Some(checkpoint_id);
        self
    }

    /// Set the checkpoint namespace
    pub fn with_checkpoint_ns(mut self, checkpoint_ns: String) -> Self {
        self.checkpoint_ns = Some(checkpoint_ns);
        self
    }

    /// Namespace, defaulting to the root namespace
    pub fn ns(&self) -> &str {
        self.checkpoint_ns.as_deref().unwrap_or("")
    }

    /// Thread id, or `Invalid` when the address has none
    pub fn require_thread_id(&self) -> Result<&str> {
        self.thread_id
            .as_deref()
            .ok_or_else(|| WarehouseError::Invalid("thread_id is required".to_string()))
    }

    /// Checkpoint id, or `Invalid` when the address has none
    pub fn require_checkpoint_id(&self) -> Result<&str> {
        self.checkpoint_id
            .as_deref()
            .ok_or_else(|| WarehouseError::Invalid("checkpoint_id is required".to_string()))
    }
}

/// A tuple containing a checkpoint and its associated data
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointTuple {
    /// Fully qualified address of this checkpoint
    pub config: CheckpointConfig,

    /// The checkpoint itself
    pub checkpoint: Checkpoint,

    /// Metadata associated with the checkpoint
    pub metadata: CheckpointMetadata,

    /// Address of the checkpoint this one resumed from (if any)
    pub parent_config: Option<CheckpointConfig>,

    /// Writes recorded against this checkpoint, ordered by task id then write index
    pub pending_writes: Vec<PendingWrite>,
}

impl CheckpointTuple {
    /// Create a new checkpoint tuple
    pub fn new(
        config: CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            config,
            checkpoint,
            metadata,
            parent_config: None,
            pending_writes: Vec::new(),
        }
    }

    /// Set the parent configuration
    pub fn with_parent_config(mut self, parent_config: CheckpointConfig) -> Self {
        self.parent_config = Some(parent_config);
        self
    }

    /// Set the pending writes
    pub fn with_pending_writes(mut self, pending_writes: Vec<PendingWrite>) -> Self {
        self.pending_writes = pending_writes;
        self
    }

    /// Id of the parent checkpoint, if any
    pub fn parent_checkpoint_id(&self) -> Option<&str> {
        self.parent_config
            .as_ref()
            .and_then(|parent| parent.checkpoint_id.as_deref())
    }
}
