pub mod memory;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod serializer;
pub mod sqlite;
pub mod store;
pub mod thread;
pub mod types;

pub mod prelude {
    pub use crate::memory::MemoryCheckpointStore;
    #[cfg(feature = "mysql")]
    pub use crate::mysql::{ChatMessageRecord, MySqlCheckpointStore};
    pub use crate::serializer::{MessageSerializer, SerializerProtocol, StructuralSerializer};
    pub use crate::sqlite::SqliteCheckpointStore;
    pub use crate::store::{collect_tuples, CheckpointStore, CheckpointStream};
    pub use crate::thread::{open_store, ThreadCheckpointer};
    pub use crate::types::{
        Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource, CheckpointTuple,
        ChannelVersions, ListOptions, PendingWrite, MESSAGES,
    };
}
