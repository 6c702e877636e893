use thiserror::Error;

/// Top-level error type for Threadline.
#[derive(Debug, Error)]
pub enum ThreadlineError {
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Failures raised by checkpoint store backends.
///
/// Callers treat every variant as fatal for the current step: a graph must not
/// continue on stale state after a failed load or save.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The store was built without the parameters its backend needs.
    #[error("Checkpoint store not configured: {0}")]
    NotConfigured(String),

    /// Opening or using the backing store failed at the transport level.
    #[error("Checkpoint store connection failed: {0}")]
    ConnectionFailed(String),

    /// A stored checkpoint or metadata blob could not be encoded or decoded.
    #[error("Corrupt checkpoint record: {0}")]
    CorruptRecord(String),

    #[error("Invalid table name: {0:?}")]
    InvalidTableName(String),

    #[error("Port {port} is the default port of {engine}, not of this backend")]
    MisconfiguredPort { port: u16, engine: &'static str },

    /// Provisioning the checkpoint table failed.
    #[error("Failed to set up table '{table}': {source}")]
    Setup {
        table: String,
        #[source]
        source: Box<CheckpointError>,
    },
}

/// Failures raised by the state reducer engine.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Invalid state declaration: {0}")]
    InvalidDeclaration(String),

    #[error("Unknown channel operation: {0}")]
    UnknownOperation(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Script exceeded its {timeout_ms}ms budget")]
    ScriptTimeout { timeout_ms: u64 },

    #[error("Post-processing failed: {0}")]
    PostProcess(String),

    #[error("Run on thread '{0}' has not started")]
    NotStarted(String),

    #[error("Run on thread '{0}' already terminated")]
    AlreadyTerminated(String),
}

pub type Result<T> = std::result::Result<T, ThreadlineError>;
