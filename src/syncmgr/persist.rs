//! Persistence capability used by sync tasks
//!
//! `Persister` is the seam between the coordinator and storage. The
//! coordinator only sees success or failure; how a task's rows become
//! durable objects is up to the implementation.
//!
//! `ChunkStorePersister` writes tasks into a `ChunkStore`:
//!
//! ```text
//! Legacy:   {root}/insert_log/{coll}/{part}/{seg}/{field}/{ts_to}   one per field
//!           {root}/delta_log/{coll}/{part}/{seg}/{ts_to}            deletes
//!           {root}/stats_log/{coll}/{part}/{seg}/{ts_to}            JSON stats
//! Columnar: {root}/columnar/{coll}/{part}/{seg}/{ts_from}-{ts_to}   everything
//! ```
//!
//! Every binary object starts with a 40-byte checksummed header.

use crate::chunk_store::ChunkStore;
use crate::syncmgr::task::{
    DeleteBatch, FieldId, InsertBatch, SegmentId, SyncMeta, SyncTask,
};
use crate::tso::Timestamp;
use bytes::{Buf, BufMut, BytesMut};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Error type for persistence
#[derive(Debug)]
pub enum PersistError {
    /// Storage I/O failure
    Io(std::io::Error),
    /// Payload references a field the schema does not have
    UnknownField {
        segment_id: SegmentId,
        field_id: FieldId,
    },
    /// Encoding failure
    Encode(String),
    /// Decoding or checksum failure when reading an object back
    Corrupt(String),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Io(e) => write!(f, "I/O error: {}", e),
            PersistError::UnknownField {
                segment_id,
                field_id,
            } => write!(f, "segment {} has data for unknown field {}", segment_id, field_id),
            PersistError::Encode(msg) => write!(f, "Encode error: {}", msg),
            PersistError::Corrupt(msg) => write!(f, "Corrupt object: {}", msg),
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        PersistError::Io(e)
    }
}

impl From<bincode::Error> for PersistError {
    fn from(e: bincode::Error) -> Self {
        PersistError::Encode(e.to_string())
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        PersistError::Encode(e.to_string())
    }
}

pub type PersistFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PersistError>> + Send + 'a>>;

/// Opaque persistence capability
pub trait Persister: Send + Sync + 'static {
    fn persist<'a>(&'a self, task: &'a SyncTask) -> PersistFuture<'a>;
}

// ============================================================================
// Binlog framing
// ============================================================================

const BINLOG_MAGIC: &[u8; 4] = b"SBLG";
const BINLOG_VERSION: u8 = 1;
pub const BINLOG_HEADER_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinlogKind {
    Insert = 0,
    Delete = 1,
    Columnar = 2,
}

impl BinlogKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(BinlogKind::Insert),
            1 => Some(BinlogKind::Delete),
            2 => Some(BinlogKind::Columnar),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogHeader {
    pub kind: BinlogKind,
    pub ts_from: Timestamp,
    pub ts_to: Timestamp,
    pub row_count: u64,
    pub payload_len: u32,
    pub payload_crc: u32,
}

/// Frame `payload` behind a binlog header
pub fn encode_binlog(
    kind: BinlogKind,
    ts_from: Timestamp,
    ts_to: Timestamp,
    row_count: u64,
    payload: &[u8],
) -> Result<Vec<u8>, PersistError> {
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| PersistError::Encode(format!("payload too large: {} bytes", payload.len())))?;
    let mut out = BytesMut::with_capacity(BINLOG_HEADER_SIZE + payload.len());
    out.put_slice(BINLOG_MAGIC);
    out.put_u8(BINLOG_VERSION);
    out.put_u8(kind as u8);
    out.put_bytes(0, 2);
    out.put_u64_le(ts_from.as_u64());
    out.put_u64_le(ts_to.as_u64());
    out.put_u64_le(row_count);
    out.put_u32_le(payload_len);
    out.put_u32_le(crc32fast::hash(payload));
    out.put_slice(payload);
    Ok(out.to_vec())
}

/// Parse and verify a framed binlog, returning the header and payload
pub fn decode_binlog(data: &[u8]) -> Result<(BinlogHeader, &[u8]), PersistError> {
    if data.len() < BINLOG_HEADER_SIZE {
        return Err(PersistError::Corrupt(format!("short binlog: {} bytes", data.len())));
    }
    if &data[0..4] != BINLOG_MAGIC {
        return Err(PersistError::Corrupt(format!("bad magic {:?}", &data[0..4])));
    }
    if data[4] != BINLOG_VERSION {
        return Err(PersistError::Corrupt(format!("unsupported version {}", data[4])));
    }
    let kind = BinlogKind::from_u8(data[5])
        .ok_or_else(|| PersistError::Corrupt(format!("unknown binlog kind {}", data[5])))?;
    let mut fields = &data[8..BINLOG_HEADER_SIZE];
    let header = BinlogHeader {
        kind,
        ts_from: Timestamp(fields.get_u64_le()),
        ts_to: Timestamp(fields.get_u64_le()),
        row_count: fields.get_u64_le(),
        payload_len: fields.get_u32_le(),
        payload_crc: fields.get_u32_le(),
    };
    let payload = &data[BINLOG_HEADER_SIZE..];
    if payload.len() != header.payload_len as usize {
        return Err(PersistError::Corrupt(format!(
            "payload length {} does not match header {}",
            payload.len(),
            header.payload_len
        )));
    }
    let actual = crc32fast::hash(payload);
    if actual != header.payload_crc {
        return Err(PersistError::Corrupt(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            header.payload_crc, actual
        )));
    }
    Ok((header, payload))
}

/// Body of a columnar object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnarChunk {
    pub inserts: Option<InsertBatch>,
    pub deletes: Option<DeleteBatch>,
}

#[derive(Serialize)]
struct ColumnarChunkRef<'a> {
    inserts: Option<&'a InsertBatch>,
    deletes: Option<&'a DeleteBatch>,
}

/// Per-sync statistics written next to legacy binlogs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSyncStats {
    pub segment_id: SegmentId,
    pub row_count: u64,
    pub delete_count: u64,
    pub ts_from: Timestamp,
    pub ts_to: Timestamp,
    pub checkpoint_ts: Timestamp,
}

// ============================================================================
// ChunkStorePersister
// ============================================================================

/// Persists sync tasks as objects in a `ChunkStore`
pub struct ChunkStorePersister<S: ChunkStore> {
    store: S,
    root: String,
}

impl<S: ChunkStore> ChunkStorePersister<S> {
    pub fn new(store: S, root: impl Into<String>) -> Self {
        ChunkStorePersister {
            store,
            root: root.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn segment_dir(&self, kind: &str, meta: &SyncMeta) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.root, kind, meta.collection_id, meta.partition_id, meta.segment_id
        )
    }

    pub fn insert_log_key(&self, meta: &SyncMeta, field_id: FieldId) -> String {
        format!("{}/{}/{}", self.segment_dir("insert_log", meta), field_id, meta.ts_to.as_u64())
    }

    pub fn delta_log_key(&self, meta: &SyncMeta) -> String {
        format!("{}/{}", self.segment_dir("delta_log", meta), meta.ts_to.as_u64())
    }

    pub fn stats_log_key(&self, meta: &SyncMeta) -> String {
        format!("{}/{}", self.segment_dir("stats_log", meta), meta.ts_to.as_u64())
    }

    pub fn columnar_key(&self, meta: &SyncMeta) -> String {
        format!(
            "{}/{}-{}",
            self.segment_dir("columnar", meta),
            meta.ts_from.as_u64(),
            meta.ts_to.as_u64()
        )
    }

    fn encode_legacy(
        &self,
        meta: &SyncMeta,
        inserts: Option<&InsertBatch>,
        deletes: Option<&DeleteBatch>,
    ) -> Result<Vec<(String, Vec<u8>)>, PersistError> {
        let mut objects = Vec::new();
        let mut row_count = 0;

        if let Some(batch) = inserts {
            // Validate the whole batch before producing any object
            for field_id in batch.columns.keys() {
                if meta.schema.field(*field_id).is_none() {
                    return Err(PersistError::UnknownField {
                        segment_id: meta.segment_id,
                        field_id: *field_id,
                    });
                }
            }
            row_count = batch.row_count;
            for (field_id, column) in &batch.columns {
                let framed = encode_binlog(
                    BinlogKind::Insert,
                    meta.ts_from,
                    meta.ts_to,
                    batch.row_count,
                    column,
                )?;
                objects.push((self.insert_log_key(meta, *field_id), framed));
            }
        }

        let mut delete_count = 0;
        if let Some(deletes) = deletes.filter(|d| !d.is_empty()) {
            delete_count = deletes.len() as u64;
            let body = bincode::serialize(deletes)?;
            let framed = encode_binlog(BinlogKind::Delete, meta.ts_from, meta.ts_to, delete_count, &body)?;
            objects.push((self.delta_log_key(meta), framed));
        }

        let stats = SegmentSyncStats {
            segment_id: meta.segment_id,
            row_count,
            delete_count,
            ts_from: meta.ts_from,
            ts_to: meta.ts_to,
            checkpoint_ts: meta.checkpoint.timestamp,
        };
        objects.push((self.stats_log_key(meta), serde_json::to_vec(&stats)?));
        Ok(objects)
    }

    fn encode_columnar(
        &self,
        meta: &SyncMeta,
        inserts: Option<&InsertBatch>,
        deletes: Option<&DeleteBatch>,
    ) -> Result<Vec<(String, Vec<u8>)>, PersistError> {
        let row_count = inserts.map(|b| b.row_count).unwrap_or(0);
        let body = bincode::serialize(&ColumnarChunkRef { inserts, deletes })?;
        let framed = encode_binlog(BinlogKind::Columnar, meta.ts_from, meta.ts_to, row_count, &body)?;
        Ok(vec![(self.columnar_key(meta), framed)])
    }
}

/// Decode the body of a columnar object written by `ChunkStorePersister`
pub fn decode_columnar(data: &[u8]) -> Result<(BinlogHeader, ColumnarChunk), PersistError> {
    let (header, payload) = decode_binlog(data)?;
    if header.kind != BinlogKind::Columnar {
        return Err(PersistError::Corrupt(format!("expected columnar object, got {:?}", header.kind)));
    }
    let chunk = bincode::deserialize(payload)?;
    Ok((header, chunk))
}

impl<S: ChunkStore> Persister for ChunkStorePersister<S> {
    fn persist<'a>(&'a self, task: &'a SyncTask) -> PersistFuture<'a> {
        Box::pin(async move {
            let meta = task.meta();
            let payload = task.payload();
            if payload.is_empty() {
                debug!(segment_id = meta.segment_id, "nothing buffered, skipping object writes");
                return Ok(());
            }

            let inserts = payload.inserts.as_ref();
            let deletes = payload.deletes.as_ref();
            let objects = match task {
                SyncTask::Legacy(_) => self.encode_legacy(meta, inserts, deletes)?,
                SyncTask::Columnar(_) => self.encode_columnar(meta, inserts, deletes)?,
            };

            let count = objects.len();
            try_join_all(objects.iter().map(|(key, data)| self.store.put(key, data))).await?;
            debug!(
                segment_id = meta.segment_id,
                kind = ?task.kind(),
                objects = count,
                "segment data persisted"
            );
            Ok(())
        })
    }
}
