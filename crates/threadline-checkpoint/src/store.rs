use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, TryStreamExt};

use threadline_core::error::Result;
use threadline_core::value::ChannelValue;

use crate::serializer::SerializerProtocol;
use crate::types::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource, CheckpointTuple,
    ChannelVersions, ListOptions, PendingWrite,
};

/// Lazy, finite stream of checkpoint tuples produced by [`CheckpointStore::list`].
///
/// The stream is not restartable; calling `list` again re-queries the backend.
pub type CheckpointStream<'a> = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send + 'a>>;

/// Async storage backend for graph checkpoints.
///
/// Every backend implements these operations with identical semantics. All
/// reads and writes are scoped to the thread named in the config; threads
/// exist implicitly as the set of checkpoints sharing a `thread_id`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Fetch the checkpoint named by `config.checkpoint_id`, or the latest one
    /// for the thread when no id is given or the id is unknown.
    ///
    /// Returns `Ok(None)` for a thread with no checkpoints.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// Store a checkpoint, merging `new_versions` into its channel versions.
    ///
    /// The row is keyed by `(config.thread_id, checkpoint.id)`; its parent is
    /// `config.checkpoint_id`. Re-putting the same key overwrites it. Returns a
    /// config addressing the stored checkpoint.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Record writes produced by a task ahead of the owning step's `put`.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, ChannelValue)>,
        task_id: &str,
    ) -> Result<()>;

    /// Stream the thread's checkpoints in descending id order.
    fn list<'a>(&'a self, config: &CheckpointConfig, options: ListOptions) -> CheckpointStream<'a>;

    /// Remove the thread's checkpoints.
    ///
    /// A no-op on an empty thread. Deletion is advisory cleanup: backend
    /// failures are logged, not returned.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}

/// Drain a listing into a `Vec`, stopping at the first error.
pub async fn collect_tuples(stream: CheckpointStream<'_>) -> Result<Vec<CheckpointTuple>> {
    stream.try_collect().await
}

/// Merge `new_versions` into the checkpoint and drop versions of channels
/// that hold no value.
pub(crate) fn prepare_for_put(checkpoint: &mut Checkpoint, new_versions: ChannelVersions) {
    checkpoint.channel_versions.extend(new_versions);
    checkpoint.retain_known_versions();
}

/// Encode a checkpoint row for a durable backend. Failures are logged with
/// the row's context before they are returned.
pub(crate) fn encode_row(
    serde: &dyn SerializerProtocol,
    thread_id: &str,
    checkpoint: &Checkpoint,
    metadata: &CheckpointMetadata,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let encoded = serde
        .dumps_checkpoint(checkpoint)
        .and_then(|blob| Ok((blob, serde.dumps_metadata(metadata)?)));
    encoded.map_err(|e| {
        tracing::error!(
            operation = "put",
            thread_id,
            checkpoint_id = %checkpoint.id,
            error = %e,
            "failed to encode checkpoint"
        );
        e.into()
    })
}

/// Build the carrier checkpoint durable backends write for `put_writes`.
///
/// The carrier is keyed by the task id and holds the writes in
/// `pending_sends`; its parent is the checkpoint the task ran against.
pub(crate) fn pending_writes_carrier(
    config: &CheckpointConfig,
    writes: Vec<(String, ChannelValue)>,
    task_id: &str,
) -> (Checkpoint, CheckpointMetadata) {
    let mut carrier = Checkpoint::with_id(task_id);
    carrier.pending_sends = pending_writes(writes, task_id);
    let mut metadata = CheckpointMetadata::new(CheckpointSource::PendingWrites, -1);
    if let Some(parent) = &config.checkpoint_id {
        metadata.parents.insert(String::new(), parent.clone());
    }
    (carrier, metadata)
}

pub(crate) fn pending_writes(writes: Vec<(String, ChannelValue)>, task_id: &str) -> Vec<PendingWrite> {
    writes
        .into_iter()
        .map(|(channel, value)| PendingWrite {
            task_id: task_id.to_string(),
            channel,
            value,
        })
        .collect()
}
