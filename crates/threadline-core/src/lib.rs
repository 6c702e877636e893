pub mod config;
pub mod error;
pub mod message;
pub mod model;
pub mod value;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{BackendKind, ConnectionConfig, StoreConfig};
    pub use crate::error::{CheckpointError, Result, StateError, ThreadlineError};
    pub use crate::message::{Message, MessageKind, ToolCall};
    pub use crate::model::{CallOptions, ChatModel, ChatResult};
    pub use crate::value::ChannelValue;
}
