use std::sync::Arc;

use threadline_core::config::{BackendKind, StoreConfig};
#[cfg(not(feature = "mysql"))]
use threadline_core::error::CheckpointError;
use threadline_core::error::Result;
use threadline_core::value::ChannelValue;

use crate::memory::MemoryCheckpointStore;
use crate::sqlite::SqliteCheckpointStore;
use crate::store::{CheckpointStore, CheckpointStream};
use crate::types::{ChannelVersions, CheckpointConfig, CheckpointTuple, ListOptions};

/// A checkpoint store bound to one thread.
///
/// This is the handle graph nodes receive: reads and writes always target the
/// thread chosen at construction, whatever the tuple passed in claims.
#[derive(Clone)]
pub struct ThreadCheckpointer {
    store: Arc<dyn CheckpointStore>,
    thread_id: String,
}

impl ThreadCheckpointer {
    pub fn new(store: Arc<dyn CheckpointStore>, thread_id: impl Into<String>) -> Self {
        Self {
            store,
            thread_id: thread_id.into(),
        }
    }

    /// A handle over a fresh transient store.
    pub fn transient(thread_id: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryCheckpointStore::new()), thread_id)
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Config addressing the thread's latest checkpoint.
    pub fn config(&self) -> CheckpointConfig {
        CheckpointConfig::new(&self.thread_id)
    }

    /// The thread's latest checkpoint.
    pub async fn get_tuple(&self) -> Result<Option<CheckpointTuple>> {
        self.store.get_tuple(&self.config()).await
    }

    /// A specific checkpoint, or the latest when the id is unknown.
    pub async fn get_tuple_at(&self, checkpoint_id: &str) -> Result<Option<CheckpointTuple>> {
        self.store
            .get_tuple(&self.config().with_checkpoint_id(checkpoint_id))
            .await
    }

    /// Persist a tuple. Its `parent_config` becomes the stored parent pointer.
    pub async fn put_tuple(&self, tuple: CheckpointTuple) -> Result<CheckpointConfig> {
        if tuple.config.thread_id != self.thread_id {
            tracing::warn!(
                thread_id = %self.thread_id,
                tuple_thread_id = %tuple.config.thread_id,
                "tuple addressed to another thread; storing under the handle's thread"
            );
        }
        let mut config = self.config();
        config.checkpoint_id = tuple.parent_config.and_then(|parent| parent.checkpoint_id);
        self.store
            .put(&config, tuple.checkpoint, tuple.metadata, ChannelVersions::new())
            .await
    }

    /// Record task writes against `parent_id` (the checkpoint the task ran on).
    pub async fn put_writes(
        &self,
        parent_id: Option<&str>,
        writes: Vec<(String, ChannelValue)>,
        task_id: &str,
    ) -> Result<()> {
        let mut config = self.config();
        config.checkpoint_id = parent_id.map(str::to_string);
        self.store.put_writes(&config, writes, task_id).await
    }

    pub fn list(&self, options: ListOptions) -> CheckpointStream<'_> {
        self.store.list(&self.config(), options)
    }

    /// Clear the thread's checkpoints.
    pub async fn delete_tuple(&self) -> Result<()> {
        self.store.delete_thread(&self.thread_id).await
    }
}

impl std::fmt::Debug for ThreadCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCheckpointer")
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

/// Build the store described by `config` and bind it to its thread.
///
/// Validation runs first, so a bad port or table name is reported without
/// any I/O. Durable stores set up their table lazily on first use.
pub fn open_store(config: &StoreConfig) -> Result<ThreadCheckpointer> {
    config.validate()?;

    let store: Arc<dyn CheckpointStore> = match config.backend {
        BackendKind::Transient => Arc::new(MemoryCheckpointStore::new()),
        BackendKind::EmbeddedFile => {
            // `validate` guarantees the path is present.
            let path = config.file_path.clone().unwrap_or_default();
            Arc::new(SqliteCheckpointStore::new(path).with_table_name(&config.table_name)?)
        }
        BackendKind::Relational => relational_store(config)?,
    };

    tracing::debug!(
        backend = %config.backend,
        thread_id = %config.thread_id,
        table = %config.table_name,
        "opened checkpoint store"
    );
    Ok(ThreadCheckpointer::new(store, &config.thread_id))
}

#[cfg(feature = "mysql")]
fn relational_store(config: &StoreConfig) -> Result<Arc<dyn CheckpointStore>> {
    use threadline_core::error::CheckpointError;

    let connection = config.connection.as_ref().ok_or_else(|| {
        CheckpointError::NotConfigured("relational backend requires connection".into())
    })?;
    Ok(Arc::new(crate::mysql::MySqlCheckpointStore::new(
        connection,
        &config.table_name,
    )?))
}

#[cfg(not(feature = "mysql"))]
fn relational_store(_config: &StoreConfig) -> Result<Arc<dyn CheckpointStore>> {
    Err(CheckpointError::NotConfigured(
        "relational backend requires the `mysql` feature".into(),
    )
    .into())
}
