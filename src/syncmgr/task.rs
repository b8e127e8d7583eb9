//! Sync tasks
//!
//! A sync task persists one segment's buffered data up to a checkpoint
//! candidate. There are two kinds, chosen when the task is built:
//!
//! - `Legacy`: one binlog per field, plus delta and stats logs
//! - `Columnar`: a single columnar object holding every field and the deletes
//!
//! Both expose the same accessors and `execute`, so the coordinator never
//! looks inside.

use crate::syncmgr::persist::{PersistFuture, Persister};
use crate::syncmgr::position::MsgPosition;
use crate::syncmgr::SyncError;
use crate::tso::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type SegmentId = i64;
pub type CollectionId = i64;
pub type PartitionId = i64;
pub type FieldId = i64;

/// Field data type, as far as persistence cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int64,
    Float,
    Double,
    VarChar,
    FloatVector { dim: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub field_id: FieldId,
    pub name: String,
    pub data_type: DataType,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

impl CollectionSchema {
    pub fn field(&self, field_id: FieldId) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }
}

/// Buffered insert rows, column-major: one encoded column per field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertBatch {
    pub row_count: u64,
    pub columns: BTreeMap<FieldId, Vec<u8>>,
}

impl InsertBatch {
    pub fn new(row_count: u64) -> Self {
        InsertBatch {
            row_count,
            columns: BTreeMap::new(),
        }
    }

    pub fn with_column(mut self, field_id: FieldId, data: impl Into<Vec<u8>>) -> Self {
        self.columns.insert(field_id, data.into());
        self
    }

    pub fn size_bytes(&self) -> usize {
        self.columns.values().map(Vec::len).sum()
    }

    /// Append another batch with the same field set
    pub fn merge(&mut self, other: InsertBatch) {
        self.row_count += other.row_count;
        for (field_id, data) in other.columns {
            self.columns.entry(field_id).or_default().extend_from_slice(&data);
        }
    }
}

/// Buffered deletes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBatch {
    pub primary_keys: Vec<i64>,
    pub timestamps: Vec<Timestamp>,
}

impl DeleteBatch {
    pub fn len(&self) -> usize {
        self.primary_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary_keys.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.primary_keys.len() * 16
    }

    pub fn merge(&mut self, other: DeleteBatch) {
        self.primary_keys.extend(other.primary_keys);
        self.timestamps.extend(other.timestamps);
    }
}

/// Identity and checkpoint candidate shared by every task kind
#[derive(Debug, Clone)]
pub struct SyncMeta {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub segment_id: SegmentId,
    pub channel_name: String,
    pub schema: Arc<CollectionSchema>,
    /// Channel position this sync makes durable
    pub checkpoint: MsgPosition,
    /// Lower bound of the data covered by this task
    pub start_position: Option<MsgPosition>,
    pub ts_from: Timestamp,
    pub ts_to: Timestamp,
}

/// Data carried by a task
#[derive(Debug, Clone, Default)]
pub struct SyncPayload {
    pub inserts: Option<InsertBatch>,
    pub deletes: Option<DeleteBatch>,
}

impl SyncPayload {
    pub fn row_count(&self) -> u64 {
        self.inserts.as_ref().map(|b| b.row_count).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.as_ref().map_or(true, |b| b.row_count == 0)
            && self.deletes.as_ref().map_or(true, DeleteBatch::is_empty)
    }
}

#[derive(Debug, Clone)]
pub struct LegacySyncTask {
    pub meta: SyncMeta,
    pub payload: SyncPayload,
}

#[derive(Debug, Clone)]
pub struct ColumnarSyncTask {
    pub meta: SyncMeta,
    pub payload: SyncPayload,
}

/// Which task kind to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncTaskKind {
    Legacy,
    Columnar,
}

/// A unit of persistence work for one segment
#[derive(Debug, Clone)]
pub enum SyncTask {
    Legacy(LegacySyncTask),
    Columnar(ColumnarSyncTask),
}

/// Registry key: one in-flight task per (segment, checkpoint timestamp)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub segment_id: SegmentId,
    pub checkpoint_ts: Timestamp,
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.segment_id, self.checkpoint_ts.as_u64())
    }
}

impl SyncTask {
    /// Build a task, checking that the checkpoint does not precede the data
    pub fn new(kind: SyncTaskKind, meta: SyncMeta, payload: SyncPayload) -> Result<Self, SyncError> {
        if let Some(start) = &meta.start_position {
            if meta.checkpoint.timestamp < start.timestamp {
                return Err(SyncError::InvalidTask(format!(
                    "segment {}: checkpoint ts {} precedes start position ts {}",
                    meta.segment_id, meta.checkpoint.timestamp, start.timestamp
                )));
            }
        }
        if meta.ts_from > meta.ts_to {
            return Err(SyncError::InvalidTask(format!(
                "segment {}: ts_from {} is after ts_to {}",
                meta.segment_id, meta.ts_from, meta.ts_to
            )));
        }
        Ok(match kind {
            SyncTaskKind::Legacy => SyncTask::Legacy(LegacySyncTask { meta, payload }),
            SyncTaskKind::Columnar => SyncTask::Columnar(ColumnarSyncTask { meta, payload }),
        })
    }

    pub fn legacy(meta: SyncMeta, payload: SyncPayload) -> Result<Self, SyncError> {
        Self::new(SyncTaskKind::Legacy, meta, payload)
    }

    pub fn columnar(meta: SyncMeta, payload: SyncPayload) -> Result<Self, SyncError> {
        Self::new(SyncTaskKind::Columnar, meta, payload)
    }

    pub fn kind(&self) -> SyncTaskKind {
        match self {
            SyncTask::Legacy(_) => SyncTaskKind::Legacy,
            SyncTask::Columnar(_) => SyncTaskKind::Columnar,
        }
    }

    pub fn meta(&self) -> &SyncMeta {
        match self {
            SyncTask::Legacy(t) => &t.meta,
            SyncTask::Columnar(t) => &t.meta,
        }
    }

    pub fn payload(&self) -> &SyncPayload {
        match self {
            SyncTask::Legacy(t) => &t.payload,
            SyncTask::Columnar(t) => &t.payload,
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.meta().segment_id
    }

    pub fn channel_name(&self) -> &str {
        &self.meta().channel_name
    }

    pub fn start_position(&self) -> Option<&MsgPosition> {
        self.meta().start_position.as_ref()
    }

    pub fn checkpoint(&self) -> &MsgPosition {
        &self.meta().checkpoint
    }

    pub fn key(&self) -> TaskKey {
        TaskKey {
            segment_id: self.segment_id(),
            checkpoint_ts: self.checkpoint().timestamp,
        }
    }

    /// Persist this task's data through `persister`
    pub fn execute<'a, P: Persister + ?Sized>(&'a self, persister: &'a P) -> PersistFuture<'a> {
        persister.persist(self)
    }
}
