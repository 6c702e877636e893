use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tokio::sync::OnceCell;

use threadline_core::config::{sanitize_table_name, DEFAULT_TABLE_NAME};
use threadline_core::error::{CheckpointError, Result};
use threadline_core::value::ChannelValue;

use crate::serializer::{MessageSerializer, SerializerProtocol};
use crate::store::{
    encode_row, pending_writes_carrier, prepare_for_put, CheckpointStore, CheckpointStream,
};
use crate::types::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple, ChannelVersions,
    ListOptions,
};

/// A raw checkpoint row, decoded outside the connection lock.
struct StoredRow {
    checkpoint_id: String,
    parent_id: Option<String>,
    checkpoint: Vec<u8>,
    metadata: Vec<u8>,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        checkpoint_id: row.get(0)?,
        parent_id: row.get(1)?,
        checkpoint: row.get(2)?,
        metadata: row.get(3)?,
    })
}

/// SQLite-backed checkpoint store persisting to a single local file.
///
/// The table is created on first use, at most once per store instance. All
/// SQLite operations are dispatched to a blocking thread via
/// `tokio::task::spawn_blocking`.
///
/// Clearing a thread keeps its rows and empties their channel values and
/// pending writes, so the step history stays auditable.
pub struct SqliteCheckpointStore {
    /// `None` opens a private in-memory database.
    path: Option<PathBuf>,
    table: String,
    serde: Arc<dyn SerializerProtocol>,
    conn: OnceCell<Arc<Mutex<Connection>>>,
}

impl SqliteCheckpointStore {
    /// Use (or create) a SQLite database at the given path. Nothing is opened
    /// until the first operation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            table: DEFAULT_TABLE_NAME.to_string(),
            serde: Arc::new(MessageSerializer),
            conn: OnceCell::new(),
        }
    }

    /// Use a private in-memory SQLite database (useful for tests).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            ..Self::new(PathBuf::new())
        }
    }

    /// Store checkpoints in a differently named table.
    pub fn with_table_name(mut self, table: &str) -> Result<Self> {
        self.table = sanitize_table_name(table)?;
        Ok(self)
    }

    pub fn with_serializer(mut self, serde: Arc<dyn SerializerProtocol>) -> Self {
        self.serde = serde;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Open the database and create the table, once.
    async fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let path = self.path.clone();
                let table = self.table.clone();
                tokio::task::spawn_blocking(move || open_and_setup(path, &table))
                    .await
                    .map_err(|e| CheckpointError::ConnectionFailed(format!("spawn_blocking: {e}")))?
                    .map(|conn| Arc::new(Mutex::new(conn)))
                    .map_err(|source| {
                        tracing::error!(table = %self.table, error = %source, "checkpoint table setup failed");
                        CheckpointError::Setup {
                            table: self.table.clone(),
                            source: Box::new(source),
                        }
                    })
            })
            .await?;
        Ok(Arc::clone(conn))
    }

    /// Run `f` against the connection on a blocking thread.
    async fn with_conn<T, F>(&self, operation: &'static str, thread_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.connection().await?;
        let result = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .map_err(|e| CheckpointError::ConnectionFailed(format!("spawn_blocking: {e}")))?;

        result.map_err(|e| {
            tracing::error!(operation, thread_id, error = %e, "sqlite checkpoint operation failed");
            CheckpointError::ConnectionFailed(format!("{operation}: {e}")).into()
        })
    }

    fn decode_row(&self, thread_id: &str, row: StoredRow) -> Result<CheckpointTuple> {
        let decoded = self
            .serde
            .loads_checkpoint(&row.checkpoint)
            .and_then(|cp| Ok((cp, self.serde.loads_metadata(&row.metadata)?)));
        match decoded {
            Ok((checkpoint, metadata)) => Ok(CheckpointTuple::from_row(
                thread_id,
                checkpoint,
                metadata,
                row.parent_id,
            )),
            Err(e) => {
                tracing::error!(
                    thread_id,
                    checkpoint_id = %row.checkpoint_id,
                    error = %e,
                    "failed to decode stored checkpoint"
                );
                Err(e.into())
            }
        }
    }

    async fn fetch_rows(&self, thread_id: &str, options: &ListOptions) -> Result<Vec<StoredRow>> {
        let mut sql = format!(
            "SELECT checkpoint_id, parent_id, checkpoint, metadata FROM {} WHERE thread_id = ?",
            self.table
        );
        let mut args = vec![SqlValue::Text(thread_id.to_owned())];
        if let Some(before) = &options.before {
            sql.push_str(" AND checkpoint_id < ?");
            args.push(SqlValue::Text(before.clone()));
        }
        if let Some(parent) = &options.parent {
            sql.push_str(" AND parent_id = ?");
            args.push(SqlValue::Text(parent.clone()));
        }
        sql.push_str(" ORDER BY checkpoint_id DESC");
        if let Some(limit) = options.sql_limit() {
            sql.push_str(" LIMIT ?");
            args.push(SqlValue::Integer(limit));
        }

        self.with_conn("list", thread_id, move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), read_row)?;
            rows.collect()
        })
        .await
    }

    async fn write_row(
        &self,
        thread_id: &str,
        parent_id: Option<String>,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
    ) -> Result<()> {
        let (checkpoint_blob, metadata_blob) =
            encode_row(self.serde.as_ref(), thread_id, checkpoint, metadata)?;
        let sql = format!(
            "INSERT OR REPLACE INTO {}
                (thread_id, checkpoint_id, parent_id, checkpoint, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            self.table
        );
        let owned_thread = thread_id.to_owned();
        let checkpoint_id = checkpoint.id.clone();
        self.with_conn("put", thread_id, move |conn| {
            conn.execute(
                &sql,
                params![owned_thread, checkpoint_id, parent_id, checkpoint_blob, metadata_blob],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_thread(&self, thread_id: &str) -> Result<usize> {
        let rows = self.fetch_rows(thread_id, &ListOptions::new()).await?;
        let mut cleared = 0;
        for row in rows {
            let mut tuple = self.decode_row(thread_id, row)?;
            tuple.checkpoint.channel_values.clear();
            tuple.checkpoint.channel_versions.clear();
            tuple.checkpoint.pending_sends.clear();
            let parent_id = tuple.parent_config.and_then(|p| p.checkpoint_id);
            self.write_row(thread_id, parent_id, &tuple.checkpoint, &tuple.metadata)
                .await?;
            cleared += 1;
        }
        Ok(cleared)
    }
}

fn open_and_setup(path: Option<PathBuf>, table: &str) -> std::result::Result<Connection, CheckpointError> {
    let conn = match path {
        Some(path) => Connection::open(path),
        None => Connection::open_in_memory(),
    }
    .map_err(|e| CheckpointError::ConnectionFailed(format!("failed to open database: {e}")))?;

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            thread_id TEXT NOT NULL,
            checkpoint_id TEXT NOT NULL,
            parent_id TEXT,
            checkpoint BLOB,
            metadata BLOB,
            PRIMARY KEY (thread_id, checkpoint_id)
        );
        CREATE INDEX IF NOT EXISTS {table}_parent_idx ON {table} (thread_id, parent_id);"
    ))
    .map_err(|e| CheckpointError::ConnectionFailed(format!("failed to create table: {e}")))?;
    tracing::debug!(table, "checkpoint table ready");
    Ok(conn)
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let by_id = format!(
            "SELECT checkpoint_id, parent_id, checkpoint, metadata FROM {}
             WHERE thread_id = ?1 AND checkpoint_id = ?2",
            self.table
        );
        let latest = format!(
            "SELECT checkpoint_id, parent_id, checkpoint, metadata FROM {}
             WHERE thread_id = ?1 ORDER BY checkpoint_id DESC LIMIT 1",
            self.table
        );
        let thread_id = config.thread_id.clone();
        let checkpoint_id = config.checkpoint_id.clone();

        let row = self
            .with_conn("get", &config.thread_id, move |conn| {
                if let Some(checkpoint_id) = &checkpoint_id {
                    let found = conn
                        .query_row(&by_id, params![thread_id, checkpoint_id], read_row)
                        .optional()?;
                    if found.is_some() {
                        return Ok(found);
                    }
                }
                conn.query_row(&latest, params![thread_id], read_row).optional()
            })
            .await?;

        row.map(|row| self.decode_row(&config.thread_id, row))
            .transpose()
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        mut checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        prepare_for_put(&mut checkpoint, new_versions);
        self.write_row(
            &config.thread_id,
            config.checkpoint_id.clone(),
            &checkpoint,
            &metadata,
        )
        .await?;
        tracing::debug!(
            thread_id = %config.thread_id,
            checkpoint_id = %checkpoint.id,
            step = metadata.step,
            "stored checkpoint"
        );
        Ok(CheckpointConfig::new(&config.thread_id).with_checkpoint_id(checkpoint.id))
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, ChannelValue)>,
        task_id: &str,
    ) -> Result<()> {
        let (carrier, metadata) = pending_writes_carrier(config, writes, task_id);
        self.put(config, carrier, metadata, ChannelVersions::new())
            .await
            .map(|_| ())
    }

    fn list<'a>(&'a self, config: &CheckpointConfig, options: ListOptions) -> CheckpointStream<'a> {
        let thread_id = config.thread_id.clone();
        Box::pin(async_stream::stream! {
            match self.fetch_rows(&thread_id, &options).await {
                Ok(rows) => {
                    for row in rows {
                        let decoded = self.decode_row(&thread_id, row);
                        let failed = decoded.is_err();
                        yield decoded;
                        if failed {
                            break;
                        }
                    }
                }
                Err(e) => yield Err(e),
            }
        })
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        match self.clear_thread(thread_id).await {
            Ok(cleared) => {
                tracing::debug!(thread_id, cleared, "cleared checkpoint channel values");
            }
            Err(e) => {
                tracing::warn!(thread_id, error = %e, "failed to clear checkpoints");
            }
        }
        Ok(())
    }
}
