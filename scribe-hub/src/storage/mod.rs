//! Snapshot persistence.
//!
//! ```text
//! ┌─────────────┐  enqueue   ┌────────────────┐ spawn_blocking ┌──────────────┐
//! │ Room        │ ─────────► │ SnapshotWriter │ ─────────────► │ SnapshotStore│
//! │ (sequencer) │ (no await) │ (per room)     │  put, retried  │ Memory/Rocks │
//! └─────────────┘            └────────────────┘                └──────────────┘
//! ```
//!
//! The store is a plain key-value capability: one opaque snapshot per room
//! id, overwritten on every write. Writes are off the relay path.

pub mod memory;
pub mod rocks;
pub mod writer;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, RoomMetadata, StoreConfig};
pub use writer::{PersistStats, RetryPolicy, SnapshotWriter};

/// Key-value snapshot persistence keyed by room id.
///
/// Implementations must be atomic per key: a failed `put` leaves the
/// previous snapshot readable.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Latest snapshot for `room_id`, `None` for a cold room.
    fn get(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Upsert the snapshot for `room_id`.
    fn put(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError>;

    /// Rooms with a persisted snapshot.
    fn list_rooms(&self) -> Result<Vec<String>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend internal error
    DatabaseError(String),
    /// Record not found
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    IoError(String),
    /// Blocking storage task panicked or was cancelled
    TaskFailed(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Room not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
            StoreError::TaskFailed(e) => write!(f, "Storage task failed: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::TaskFailed(e.to_string())
    }
}
