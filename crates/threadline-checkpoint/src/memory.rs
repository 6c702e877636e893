use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use threadline_core::error::Result;
use threadline_core::value::ChannelValue;

use crate::store::{pending_writes, prepare_for_put, CheckpointStore, CheckpointStream};
use crate::types::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple, ChannelVersions,
    ListOptions,
};

/// Transient checkpoint store holding the current checkpoint of each thread.
///
/// Nothing survives the process and there is no history: a `put` replaces the
/// thread's previous checkpoint, and `list` yields at most that one. This is
/// the store a run falls back to when no durable memory is configured, so
/// node code never has to handle a missing store.
pub struct MemoryCheckpointStore {
    /// Map: thread_id → latest tuple
    data: RwLock<HashMap<String, CheckpointTuple>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    fn current(&self, thread_id: &str) -> Option<CheckpointTuple> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(thread_id).cloned()
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        // Only one checkpoint is held per thread; it answers any id.
        Ok(self.current(&config.thread_id))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        mut checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        prepare_for_put(&mut checkpoint, new_versions);
        let tuple = CheckpointTuple::from_row(
            &config.thread_id,
            checkpoint,
            metadata,
            config.checkpoint_id.clone(),
        );
        let written = tuple.config.clone();

        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.insert(config.thread_id.clone(), tuple);
        tracing::debug!(
            thread_id = %written.thread_id,
            checkpoint_id = ?written.checkpoint_id,
            "stored transient checkpoint"
        );
        Ok(written)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, ChannelValue)>,
        task_id: &str,
    ) -> Result<()> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let tuple = data.entry(config.thread_id.clone()).or_insert_with(|| {
            CheckpointTuple::from_row(
                &config.thread_id,
                Checkpoint::new(),
                CheckpointMetadata::default(),
                None,
            )
        });
        tuple
            .checkpoint
            .pending_sends
            .extend(pending_writes(writes, task_id));
        Ok(())
    }

    fn list<'a>(&'a self, config: &CheckpointConfig, options: ListOptions) -> CheckpointStream<'a> {
        let item = self
            .current(&config.thread_id)
            .filter(|tuple| options.admits_tuple(tuple))
            .filter(|_| options.limit != Some(0));
        Box::pin(futures::stream::iter(item.map(Ok)))
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.remove(thread_id);
        Ok(())
    }
}
