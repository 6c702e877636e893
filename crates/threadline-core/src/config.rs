use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;

/// Default name of the checkpoint table.
pub const DEFAULT_TABLE_NAME: &str = "checkpoints";

/// Default MySQL port.
pub const DEFAULT_RELATIONAL_PORT: u16 = 3306;

/// PostgreSQL's well-known port. Pointing the MySQL backend at it is almost
/// always a copy-paste mistake.
pub const POSTGRES_DEFAULT_PORT: u16 = 5432;

static TABLE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9_]+$").expect("table name pattern is a valid regex")
});

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is a valid regex"));

/// Which checkpoint backend a store is built on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Process memory only; the default when no durable memory is wired in.
    #[default]
    Transient,
    /// A single local SQLite file.
    EmbeddedFile,
    /// A MySQL server.
    Relational,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::EmbeddedFile => write!(f, "embedded-file"),
            Self::Relational => write!(f, "relational"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transient" | "memory" => Ok(Self::Transient),
            "embedded-file" | "sqlite" => Ok(Self::EmbeddedFile),
            "relational" | "mysql" => Ok(Self::Relational),
            other => Err(CheckpointError::NotConfigured(format!(
                "unknown backend '{other}'"
            ))),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_RELATIONAL_PORT
}

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

/// Connection parameters for the relational backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ConnectionConfig {
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_RELATIONAL_PORT,
            database: database.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Parameters the surrounding platform uses to build a checkpoint store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Relational backend only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionConfig>,

    /// Embedded-file backend only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,

    /// Thread the store's lifecycle hooks are scoped to.
    pub thread_id: String,

    #[serde(default = "default_table_name")]
    pub table_name: String,
}

impl StoreConfig {
    pub fn transient(thread_id: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Transient,
            connection: None,
            file_path: None,
            thread_id: thread_id.into(),
            table_name: default_table_name(),
        }
    }

    pub fn embedded_file(path: impl Into<PathBuf>, thread_id: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::EmbeddedFile,
            file_path: Some(path.into()),
            ..Self::transient(thread_id)
        }
    }

    pub fn relational(connection: ConnectionConfig, thread_id: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Relational,
            connection: Some(connection),
            ..Self::transient(thread_id)
        }
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Build a configuration from `THREADLINE_*` environment variables.
    ///
    /// `THREADLINE_THREAD_ID` is required. `THREADLINE_BACKEND` defaults to
    /// `transient`; the relational backend reads `THREADLINE_DB_HOST`,
    /// `THREADLINE_DB_PORT`, `THREADLINE_DB_NAME`, `THREADLINE_DB_USER` and
    /// `THREADLINE_DB_PASSWORD`; the embedded-file backend reads
    /// `THREADLINE_FILE_PATH`.
    pub fn from_env() -> Result<Self, CheckpointError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`StoreConfig::from_env`] with a caller-provided lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CheckpointError> {
        let thread_id = lookup("THREADLINE_THREAD_ID").ok_or_else(|| {
            CheckpointError::NotConfigured("THREADLINE_THREAD_ID is not set".into())
        })?;
        let backend = match lookup("THREADLINE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => BackendKind::default(),
        };

        let mut config = Self::transient(thread_id);
        config.backend = backend;
        if let Some(table) = lookup("THREADLINE_TABLE_NAME") {
            config.table_name = table;
        }
        config.file_path = lookup("THREADLINE_FILE_PATH").map(PathBuf::from);

        if let Some(host) = lookup("THREADLINE_DB_HOST") {
            let port = match lookup("THREADLINE_DB_PORT") {
                Some(raw) => raw.parse().map_err(|_| {
                    CheckpointError::NotConfigured(format!("invalid THREADLINE_DB_PORT '{raw}'"))
                })?,
                None => DEFAULT_RELATIONAL_PORT,
            };
            config.connection = Some(ConnectionConfig {
                host,
                port,
                database: lookup("THREADLINE_DB_NAME").unwrap_or_default(),
                username: lookup("THREADLINE_DB_USER").unwrap_or_default(),
                password: lookup("THREADLINE_DB_PASSWORD").unwrap_or_default(),
            });
        }

        Ok(config)
    }

    /// Check that the parameters the selected backend needs are present and sane.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.thread_id.trim().is_empty() {
            return Err(CheckpointError::NotConfigured("thread_id is empty".into()));
        }
        match self.backend {
            BackendKind::Transient => {}
            BackendKind::EmbeddedFile => {
                if self.file_path.is_none() {
                    return Err(CheckpointError::NotConfigured(
                        "embedded-file backend requires file_path".into(),
                    ));
                }
                sanitize_table_name(&self.table_name)?;
            }
            BackendKind::Relational => {
                let connection = self.connection.as_ref().ok_or_else(|| {
                    CheckpointError::NotConfigured("relational backend requires connection".into())
                })?;
                check_port(connection.port)?;
                sanitize_table_name(&self.table_name)?;
            }
        }
        Ok(())
    }
}

/// Normalize a configured table name: trim, lowercase, collapse whitespace
/// runs into `_`. Anything left that is not `[a-z0-9_]` rejects the name.
pub fn sanitize_table_name(raw: &str) -> Result<String, CheckpointError> {
    let lowered = raw.trim().to_lowercase();
    let normalized = WHITESPACE_RE.replace_all(&lowered, "_").into_owned();
    if TABLE_NAME_RE.is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(CheckpointError::InvalidTableName(raw.to_string()))
    }
}

/// Reject ports that belong to a different relational engine.
pub fn check_port(port: u16) -> Result<(), CheckpointError> {
    if port == POSTGRES_DEFAULT_PORT {
        return Err(CheckpointError::MisconfiguredPort {
            port,
            engine: "PostgreSQL",
        });
    }
    Ok(())
}
