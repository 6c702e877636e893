use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use threadline_core::message::Message;
use threadline_core::value::ChannelValue;

/// Current checkpoint snapshot format.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Reserved channel holding the conversation history.
pub const MESSAGES: &str = "messages";

/// Version token of a single channel.
pub type ChannelVersion = u64;

/// Channel name → version token.
pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// Generate a fresh checkpoint id.
///
/// UUID v7 text sorts lexicographically in creation order, which is what the
/// stores rely on for "latest" and `before` cursors.
pub fn new_checkpoint_id() -> String {
    Uuid::now_v7().to_string()
}

/// A write queued for a task before it is folded into `channel_values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub channel: String,
    pub value: ChannelValue,
}

/// A snapshot of graph state at one execution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Snapshot format version.
    pub v: u32,
    /// Identifier, totally ordered within a thread.
    pub id: String,
    /// When the snapshot was taken.
    pub ts: DateTime<Utc>,
    /// Channel name → current value.
    #[serde(default)]
    pub channel_values: HashMap<String, ChannelValue>,
    /// Channel name → version token, bumped on every overwrite.
    #[serde(default)]
    pub channel_versions: ChannelVersions,
    /// Consumer → channel versions it has already processed.
    #[serde(default)]
    pub versions_seen: HashMap<String, ChannelVersions>,
    /// Writes not yet applied to `channel_values`.
    #[serde(default)]
    pub pending_sends: Vec<PendingWrite>,
}

impl Checkpoint {
    /// An empty checkpoint with a fresh id and the current time.
    pub fn new() -> Self {
        Self::with_id(new_checkpoint_id())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            v: CHECKPOINT_VERSION,
            id: id.into(),
            ts: Utc::now(),
            channel_values: HashMap::new(),
            channel_versions: HashMap::new(),
            versions_seen: HashMap::new(),
            pending_sends: Vec::new(),
        }
    }

    /// Copy this checkpoint's state under a new id and timestamp, as the
    /// starting point for the next step.
    pub fn successor(&self) -> Self {
        Self {
            id: new_checkpoint_id(),
            ts: Utc::now(),
            ..self.clone()
        }
    }

    /// Set a channel value and bump its version.
    pub fn set_channel(&mut self, channel: impl Into<String>, value: ChannelValue) {
        let channel = channel.into();
        self.bump_version(&channel);
        self.channel_values.insert(channel, value);
    }

    /// Increment a channel's version token, starting from 1.
    pub fn bump_version(&mut self, channel: &str) -> ChannelVersion {
        let version = self.channel_versions.entry(channel.to_string()).or_insert(0);
        *version += 1;
        *version
    }

    /// Drop version entries for channels that hold no value.
    pub fn retain_known_versions(&mut self) {
        let values = &self.channel_values;
        self.channel_versions.retain(|k, _| values.contains_key(k));
    }

    /// The `messages` channel as a slice (empty if absent or not a sequence).
    pub fn messages(&self) -> &[ChannelValue] {
        self.channel_values
            .get(MESSAGES)
            .and_then(ChannelValue::as_sequence)
            .unwrap_or(&[])
    }

    /// The last entry of the `messages` channel, if it is a message.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages().last().and_then(ChannelValue::as_message)
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// Seeded from run input.
    Input,
    /// Written by a node during the run loop.
    Loop,
    /// Written by an out-of-band state update.
    Update,
    /// Copied from another checkpoint to branch history.
    Fork,
    /// Carrier for task writes recorded by `put_writes`.
    PendingWrites,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Provenance of a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    #[serde(default)]
    pub source: CheckpointSource,
    #[serde(default)]
    pub step: i64,
    /// Raw writes that produced this checkpoint, keyed by node.
    #[serde(default)]
    pub writes: Option<Value>,
    /// Branch name → parent checkpoint id.
    #[serde(default)]
    pub parents: HashMap<String, String>,
}

impl CheckpointMetadata {
    pub fn new(source: CheckpointSource, step: i64) -> Self {
        Self {
            source,
            step,
            writes: None,
            parents: HashMap::new(),
        }
    }

    pub fn with_writes(mut self, writes: Value) -> Self {
        self.writes = Some(writes);
        self
    }

    pub fn with_parent(mut self, branch: impl Into<String>, parent_id: impl Into<String>) -> Self {
        self.parents.insert(branch.into(), parent_id.into());
        self
    }
}

/// Addresses a thread and, optionally, one checkpoint in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

impl CheckpointConfig {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_id: None,
        }
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }
}

/// A checkpoint with its metadata and parent pointer, as returned by reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_config: Option<CheckpointConfig>,
}

impl CheckpointTuple {
    /// Build a tuple for a stored row.
    pub fn from_row(
        thread_id: &str,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            config: CheckpointConfig::new(thread_id).with_checkpoint_id(checkpoint.id.clone()),
            parent_config: parent_id
                .map(|parent| CheckpointConfig::new(thread_id).with_checkpoint_id(parent)),
            checkpoint,
            metadata,
        }
    }
}

/// Bounds for a history listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Only checkpoints with an id strictly less than this one.
    pub before: Option<String>,
    /// At most this many checkpoints.
    pub limit: Option<usize>,
    /// Only checkpoints whose parent is this checkpoint.
    pub parent: Option<String>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.before = Some(checkpoint_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn parent(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.parent = Some(checkpoint_id.into());
        self
    }

    /// Whether a checkpoint id passes the `before` cursor.
    pub fn admits(&self, checkpoint_id: &str) -> bool {
        self.before
            .as_deref()
            .is_none_or(|before| checkpoint_id < before)
    }

    /// Whether a tuple passes the cursor and the parent filter.
    pub fn admits_tuple(&self, tuple: &CheckpointTuple) -> bool {
        let parent_id = tuple
            .parent_config
            .as_ref()
            .and_then(|p| p.checkpoint_id.as_deref());
        self.admits(&tuple.checkpoint.id)
            && self.parent.as_deref().is_none_or(|parent| parent_id == Some(parent))
    }

    /// The limit as a SQL integer. Values past `i64::MAX` saturate.
    pub fn sql_limit(&self) -> Option<i64> {
        self.limit.map(|limit| i64::try_from(limit).unwrap_or(i64::MAX))
    }
}
