use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Connection, Row};
use tokio::sync::OnceCell;

use threadline_core::config::{check_port, sanitize_table_name, ConnectionConfig};
use threadline_core::error::{CheckpointError, Result, ThreadlineError};
use threadline_core::value::ChannelValue;

use crate::serializer::{MessageSerializer, SerializerProtocol};
use crate::store::{
    encode_row, pending_writes_carrier, prepare_for_put, CheckpointStore, CheckpointStream,
};
use crate::types::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple, ChannelVersions,
    ListOptions,
};

/// Default name of the caller-owned chat log table.
pub const DEFAULT_MESSAGE_TABLE: &str = "chat_message";

/// One row of the chat log, as returned by [`MySqlCheckpointStore::get_chat_messages`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    pub content: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

/// MySQL-backed checkpoint store.
///
/// Every operation opens its own connection and closes it when done; there is
/// no pool. The checkpoint table is created on the first successful
/// connection and not checked again by this instance.
///
/// Construction validates the port and table name but never connects, so a
/// misconfigured store fails fast without touching the network.
pub struct MySqlCheckpointStore {
    options: MySqlConnectOptions,
    table: String,
    message_table: String,
    serde: Arc<dyn SerializerProtocol>,
    setup: OnceCell<()>,
}

impl MySqlCheckpointStore {
    pub fn new(connection: &ConnectionConfig, table_name: &str) -> Result<Self> {
        check_port(connection.port)?;
        let table = sanitize_table_name(table_name)?;

        let options = MySqlConnectOptions::new()
            .host(&connection.host)
            .port(connection.port)
            .database(&connection.database)
            .username(&connection.username)
            .password(&connection.password);

        Ok(Self {
            options,
            table,
            message_table: DEFAULT_MESSAGE_TABLE.to_string(),
            serde: Arc::new(MessageSerializer),
            setup: OnceCell::new(),
        })
    }

    /// Read chat history from a differently named table.
    pub fn with_message_table(mut self, table: &str) -> Result<Self> {
        self.message_table = sanitize_table_name(table)?;
        Ok(self)
    }

    pub fn with_serializer(mut self, serde: Arc<dyn SerializerProtocol>) -> Self {
        self.serde = serde;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn message_table_name(&self) -> &str {
        &self.message_table
    }

    /// Chat log entries for one session of one flow, oldest first.
    pub async fn get_chat_messages(
        &self,
        session_id: &str,
        flow_id: &str,
    ) -> Result<Vec<ChatMessageRecord>> {
        let sql = format!(
            "SELECT content, role, created_at FROM {}
             WHERE session_id = ? AND flow_id = ?
             ORDER BY created_at ASC",
            self.message_table
        );
        let mut conn = self.connect("get_chat_messages", session_id).await?;
        let rows = sqlx::query(&sql)
            .bind(session_id)
            .bind(flow_id)
            .fetch_all(&mut conn)
            .await;
        close(conn).await;
        let rows = rows.map_err(|e| storage_error("get_chat_messages", session_id, e))?;

        rows.iter()
            .map(|row| {
                let created_at: NaiveDateTime = row
                    .try_get("created_at")
                    .map_err(|e| corrupt_column("created_at", e))?;
                Ok(ChatMessageRecord {
                    content: row.try_get("content").map_err(|e| corrupt_column("content", e))?,
                    role: row.try_get("role").map_err(|e| corrupt_column("role", e))?,
                    created_at: created_at.and_utc(),
                })
            })
            .collect()
    }

    /// Open a connection, creating the table the first time.
    async fn connect(&self, operation: &'static str, thread_id: &str) -> Result<MySqlConnection> {
        let mut conn = MySqlConnection::connect_with(&self.options)
            .await
            .map_err(|e| storage_error(operation, thread_id, e))?;

        let setup = self
            .setup
            .get_or_try_init(|| create_table(&mut conn, &self.table))
            .await;
        if let Err(e) = setup {
            close(conn).await;
            return Err(e.into());
        }
        Ok(conn)
    }

    fn list_sql(&self, options: &ListOptions) -> String {
        let mut sql = format!(
            "SELECT checkpoint_id, parent_id, checkpoint, metadata FROM {} WHERE thread_id = ?",
            self.table
        );
        if options.before.is_some() {
            sql.push_str(" AND checkpoint_id < ?");
        }
        if options.parent.is_some() {
            sql.push_str(" AND parent_id = ?");
        }
        sql.push_str(" ORDER BY checkpoint_id DESC");
        if options.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }
        sql
    }

    fn decode_row(&self, thread_id: &str, row: &MySqlRow) -> Result<CheckpointTuple> {
        let checkpoint_id: String = row
            .try_get("checkpoint_id")
            .map_err(|e| corrupt_column("checkpoint_id", e))?;
        let parent_id: Option<String> = row
            .try_get("parent_id")
            .map_err(|e| corrupt_column("parent_id", e))?;
        let checkpoint: Vec<u8> = row
            .try_get("checkpoint")
            .map_err(|e| corrupt_column("checkpoint", e))?;
        let metadata: Vec<u8> = row
            .try_get("metadata")
            .map_err(|e| corrupt_column("metadata", e))?;

        let decoded = self
            .serde
            .loads_checkpoint(&checkpoint)
            .and_then(|cp| Ok((cp, self.serde.loads_metadata(&metadata)?)));
        match decoded {
            Ok((checkpoint, metadata)) => Ok(CheckpointTuple::from_row(
                thread_id, checkpoint, metadata, parent_id,
            )),
            Err(e) => {
                tracing::error!(thread_id, %checkpoint_id, error = %e, "failed to decode stored checkpoint");
                Err(e.into())
            }
        }
    }

    async fn delete_rows(&self, thread_id: &str) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE thread_id = ?", self.table);
        let mut conn = self.connect("delete", thread_id).await?;
        let result = sqlx::query(&sql).bind(thread_id).execute(&mut conn).await;
        close(conn).await;
        result
            .map(|done| done.rows_affected())
            .map_err(|e| storage_error("delete", thread_id, e))
    }
}

async fn create_table(
    conn: &mut MySqlConnection,
    table: &str,
) -> std::result::Result<(), CheckpointError> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            thread_id VARCHAR(255) NOT NULL,
            checkpoint_id VARCHAR(255) NOT NULL,
            parent_id VARCHAR(255) NULL,
            checkpoint LONGBLOB,
            metadata LONGBLOB,
            PRIMARY KEY (thread_id, checkpoint_id),
            INDEX {table}_parent_idx (thread_id, parent_id)
        )"
    );
    match sqlx::query(&sql).execute(conn).await {
        Ok(_) => {
            tracing::debug!(table, "checkpoint table ready");
            Ok(())
        }
        Err(e) => {
            tracing::error!(table, error = %e, "checkpoint table setup failed");
            Err(CheckpointError::Setup {
                table: table.to_string(),
                source: Box::new(CheckpointError::ConnectionFailed(e.to_string())),
            })
        }
    }
}

async fn close(conn: MySqlConnection) {
    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "failed to close mysql connection cleanly");
    }
}

fn storage_error(operation: &'static str, thread_id: &str, e: sqlx::Error) -> ThreadlineError {
    tracing::error!(operation, thread_id, error = %e, "mysql checkpoint operation failed");
    CheckpointError::ConnectionFailed(format!("{operation}: {e}")).into()
}

fn corrupt_column(column: &str, e: sqlx::Error) -> ThreadlineError {
    CheckpointError::CorruptRecord(format!("column {column}: {e}")).into()
}

#[async_trait]
impl CheckpointStore for MySqlCheckpointStore {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let by_id = format!(
            "SELECT checkpoint_id, parent_id, checkpoint, metadata FROM {}
             WHERE thread_id = ? AND checkpoint_id = ?",
            self.table
        );
        let latest = format!(
            "SELECT checkpoint_id, parent_id, checkpoint, metadata FROM {}
             WHERE thread_id = ? ORDER BY checkpoint_id DESC LIMIT 1",
            self.table
        );
        let thread_id = config.thread_id.as_str();
        let mut conn = self.connect("get", thread_id).await?;

        let mut row = Ok(None);
        if let Some(checkpoint_id) = &config.checkpoint_id {
            row = sqlx::query(&by_id)
                .bind(thread_id)
                .bind(checkpoint_id.as_str())
                .fetch_optional(&mut conn)
                .await;
        }
        if matches!(row, Ok(None)) {
            row = sqlx::query(&latest)
                .bind(thread_id)
                .fetch_optional(&mut conn)
                .await;
        }
        close(conn).await;

        let row = row.map_err(|e| storage_error("get", thread_id, e))?;
        row.map(|row| self.decode_row(thread_id, &row)).transpose()
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        mut checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        prepare_for_put(&mut checkpoint, new_versions);
        let (checkpoint_blob, metadata_blob) =
            encode_row(self.serde.as_ref(), &config.thread_id, &checkpoint, &metadata)?;
        let sql = format!(
            "INSERT INTO {} (thread_id, checkpoint_id, parent_id, checkpoint, metadata)
             VALUES (?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                parent_id = VALUES(parent_id),
                checkpoint = VALUES(checkpoint),
                metadata = VALUES(metadata)",
            self.table
        );

        let thread_id = config.thread_id.as_str();
        let mut conn = self.connect("put", thread_id).await?;
        let result = sqlx::query(&sql)
            .bind(thread_id)
            .bind(checkpoint.id.as_str())
            .bind(config.checkpoint_id.as_deref())
            .bind(checkpoint_blob)
            .bind(metadata_blob)
            .execute(&mut conn)
            .await;
        close(conn).await;
        result.map_err(|e| storage_error("put", thread_id, e))?;

        tracing::debug!(
            thread_id,
            checkpoint_id = %checkpoint.id,
            step = metadata.step,
            "stored checkpoint"
        );
        Ok(CheckpointConfig::new(thread_id).with_checkpoint_id(checkpoint.id))
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
            let mut conn = match self.connect("list", &thread_id).await {
                Ok(conn) => conn,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let sql = self.list_sql(&options);
            let mut query = sqlx::query(&sql).bind(thread_id.as_str());
            if let Some(before) = &options.before {
                query = query.bind(before.as_str());
            }
            if let Some(parent) = &options.parent {
                query = query.bind(parent.as_str());
            }
            if let Some(limit) = options.sql_limit() {
                query = query.bind(limit);
            }
            {
                let mut rows = query.fetch(&mut conn);
                while let Some(row) = rows.next().await {
                    let item = row
                        .map_err(|e| storage_error("list", &thread_id, e))
                        .and_then(|row| self.decode_row(&thread_id, &row));
                    let failed = item.is_err();
                    yield item;
                    if failed {
                        break;
                    }
                }
            }
            close(conn).await;
        })
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        match self.delete_rows(thread_id).await {
            Ok(deleted) => tracing::debug!(thread_id, deleted, "deleted checkpoints"),
            Err(e) => tracing::warn!(thread_id, error = %e, "failed to delete checkpoints"),
        }
        Ok(())
    }
}
