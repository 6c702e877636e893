use std::collections::HashMap;

use serde_json::{Map, Value};

use threadline_checkpoint::thread::ThreadCheckpointer;
use threadline_checkpoint::types::{CheckpointMetadata, CheckpointSource, CheckpointTuple};
use threadline_core::error::{Result, StateError};
use threadline_core::value::ChannelValue;

use crate::declaration::StateSchema;
use crate::end::{finalize, is_terminal, EndOutput, PostProcessor};
use crate::reducer::{fold_pending_writes, merge_channel};
use crate::start::{attach_pending, resolve_latest, start};

/// Where a run stands, derived from its latest checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    NotStarted,
    Running { step: i64 },
    Terminated,
}

impl RunPhase {
    pub fn of(tuple: Option<&CheckpointTuple>) -> Self {
        match tuple {
            None => RunPhase::NotStarted,
            Some(t) if is_terminal(&t.metadata) => RunPhase::Terminated,
            Some(t) => RunPhase::Running {
                step: t.metadata.step,
            },
        }
    }
}

/// Drives one run on a thread: Start, node steps, task writes, End.
///
/// Every transition reads the run's head checkpoint, merges through the
/// schema's reducers and writes a new checkpoint parented on the head.
/// Only [`StateRun::end`] makes a run terminal.
pub struct StateRun {
    checkpointer: ThreadCheckpointer,
    schema: StateSchema,
    head: Option<CheckpointTuple>,
}

impl StateRun {
    pub fn new(checkpointer: ThreadCheckpointer, schema: StateSchema) -> Self {
        Self {
            checkpointer,
            schema,
            head: None,
        }
    }

    pub fn checkpointer(&self) -> &ThreadCheckpointer {
        &self.checkpointer
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// The checkpoint the next transition builds on.
    pub fn head(&self) -> Option<&CheckpointTuple> {
        self.head.as_ref()
    }

    pub fn phase(&self) -> RunPhase {
        RunPhase::of(self.head.as_ref())
    }

    /// Attach to whatever run the thread already holds.
    pub async fn resume(&mut self) -> Result<RunPhase> {
        self.head = resolve_latest(&self.checkpointer).await?;
        Ok(self.phase())
    }

    /// Run the Start node with the inbound values.
    pub async fn start(
        &mut self,
        inbound: HashMap<String, ChannelValue>,
    ) -> Result<&CheckpointTuple> {
        let tuple = start(&self.checkpointer, &self.schema, inbound).await?;
        Ok(&*self.head.insert(tuple))
    }

    /// Apply one node's output and persist the resulting checkpoint.
    ///
    /// Task writes recorded against the head are folded in first.
    pub async fn step(
        &mut self,
        node: &str,
        update: HashMap<String, ChannelValue>,
    ) -> Result<&CheckpointTuple> {
        let head = self.load_head().await?;
        let mut checkpoint = head.checkpoint.successor();
        let folded = fold_pending_writes(&mut checkpoint, &self.schema);

        let record: Map<String, Value> = update
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        for (channel, value) in update {
            merge_channel(&mut checkpoint, &self.schema, &channel, value);
        }

        let metadata = CheckpointMetadata::new(CheckpointSource::Loop, head.metadata.step + 1)
            .with_writes(Value::Object(Map::from_iter([(node.to_string(), Value::Object(record))])))
            .with_parent("", head.checkpoint.id.clone());
        let tuple = CheckpointTuple::from_row(
            self.checkpointer.thread_id(),
            checkpoint,
            metadata,
            Some(head.checkpoint.id),
        );
        self.checkpointer.put_tuple(tuple.clone()).await?;
        tracing::debug!(
            thread_id = self.checkpointer.thread_id(),
            node,
            step = tuple.metadata.step,
            folded,
            "step stored"
        );
        Ok(&*self.head.insert(tuple))
    }

    /// Record writes from a task running against the current head. They are
    /// folded in by the next `step` or `end`.
    pub async fn submit_task_writes(
        &self,
        task_id: &str,
        writes: Vec<(String, ChannelValue)>,
    ) -> Result<()> {
        let head = self.running_head()?;
        self.checkpointer
            .put_writes(Some(head.checkpoint.id.as_str()), writes, task_id)
            .await
    }

    /// Run the End node and persist the terminal checkpoint.
    pub async fn end(&mut self, post_processor: Option<&dyn PostProcessor>) -> Result<EndOutput> {
        let mut head = self.load_head().await?;
        fold_pending_writes(&mut head.checkpoint, &self.schema);

        let output = finalize(&head, post_processor).await?;
        let tuple = CheckpointTuple::from_row(
            self.checkpointer.thread_id(),
            output.checkpoint.clone(),
            output.metadata.clone(),
            Some(head.checkpoint.id),
        );
        self.checkpointer.put_tuple(tuple.clone()).await?;
        tracing::debug!(
            thread_id = self.checkpointer.thread_id(),
            checkpoint_id = %tuple.checkpoint.id,
            "run terminated"
        );
        self.head = Some(tuple);
        Ok(output)
    }

    fn running_head(&self) -> Result<&CheckpointTuple> {
        match (self.phase(), &self.head) {
            (RunPhase::Running { .. }, Some(head)) => Ok(head),
            (RunPhase::Terminated, _) => {
                Err(StateError::AlreadyTerminated(self.checkpointer.thread_id().to_string()).into())
            }
            _ => Err(StateError::NotStarted(self.checkpointer.thread_id().to_string()).into()),
        }
    }

    /// Re-read the head with any task writes recorded against it queued on
    /// its `pending_sends`.
    async fn load_head(&self) -> Result<CheckpointTuple> {
        let head = self.running_head()?;
        let head_id = head.checkpoint.id.clone();

        // Lookups fall back to the latest checkpoint, so check the id.
        let mut current = self
            .checkpointer
            .get_tuple_at(&head_id)
            .await?
            .filter(|t| t.checkpoint.id == head_id)
            .unwrap_or_else(|| head.clone());
        attach_pending(&self.checkpointer, &mut current).await?;
        Ok(current)
    }
}
