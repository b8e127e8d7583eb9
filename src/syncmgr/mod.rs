//! Segment Sync Coordination
//!
//! Serializes persistence work per segment while letting unrelated segments
//! persist concurrently, and tracks in-flight work so a safe channel
//! checkpoint floor can be computed.
//!
//! ## Architecture
//!
//! ```text
//! WriteBuffer ──► SyncTask ──► SyncManager ──► KeyLockDispatcher ──► Persister ──► ChunkStore
//!                                   │
//!                        in-flight registry ──► get_earliest_position(channel)
//! ```
//!
//! ## Guarantees
//!
//! - At most one task per segment executes at a time; same-segment tasks
//!   start in submission order
//! - Registry entries and segment locks are released on every exit path
//! - `block`/`unblock` share the lock space with task dispatch

pub mod key_lock;
pub mod persist;
pub mod position;
pub mod sync_manager;
pub mod task;

#[cfg(test)]
mod model;

pub use key_lock::{KeyGuard, KeyLock, KeyLockDispatcher};
pub use persist::{
    decode_binlog, decode_columnar, encode_binlog, BinlogHeader, BinlogKind, ChunkStorePersister,
    ColumnarChunk, PersistError, PersistFuture, Persister, SegmentSyncStats,
};
pub use position::{earliest, MsgPosition};
pub use sync_manager::{SyncCallback, SyncError, SyncHandle, SyncManager, SyncStats};
pub use task::{
    CollectionId, CollectionSchema, ColumnarSyncTask, DataType, DeleteBatch, FieldId, FieldSchema,
    InsertBatch, LegacySyncTask, PartitionId, SegmentId, SyncMeta, SyncPayload, SyncTask,
    SyncTaskKind, TaskKey,
};
