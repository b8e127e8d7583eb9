//! Write Buffer
//!
//! Buffers inserts and deletes per segment until they are synced, and
//! computes the safe checkpoint of each channel: the oldest position whose
//! data may still be lost on a crash.
//!
//! ```text
//! buffer_insert/buffer_delete ──► SegmentBuffer ──(size or explicit)──► SyncTask ──► SyncManager
//!
//! get_checkpoint(ch) = min(buffered start positions, earliest in-flight start)
//!                      or the latest consumed position when both are empty
//! ```
//!
//! A failed sync puts its data back into the segment buffer before the task
//! leaves the in-flight registry, so the checkpoint never passes it.

use crate::config::WriteBufferConfig;
use crate::syncmgr::{
    earliest, CollectionId, CollectionSchema, DeleteBatch, InsertBatch, MsgPosition, PartitionId,
    Persister, SegmentId, SyncError, SyncHandle, SyncManager, SyncMeta, SyncPayload, SyncTask,
    SyncTaskKind, TaskKey,
};
use crate::tso::Timestamp;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Error type for write buffer operations
#[derive(Debug)]
pub enum WriteBufferError {
    /// Channel is not (or no longer) tracked
    ChannelNotFound(String),
    /// Channel was registered twice
    ChannelExists(String),
    /// Building or submitting a sync task failed
    Sync(SyncError),
}

impl std::fmt::Display for WriteBufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteBufferError::ChannelNotFound(ch) => write!(f, "channel {} not found", ch),
            WriteBufferError::ChannelExists(ch) => write!(f, "channel {} already registered", ch),
            WriteBufferError::Sync(e) => write!(f, "Sync failed: {}", e),
        }
    }
}

impl std::error::Error for WriteBufferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriteBufferError::Sync(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SyncError> for WriteBufferError {
    fn from(e: SyncError) -> Self {
        WriteBufferError::Sync(e)
    }
}

/// What the tick stage needs from the write buffer
pub trait WriteBufferManager: Send + Sync + 'static {
    /// Safe checkpoint of `channel` and whether it should be published now
    fn get_checkpoint(&self, channel: &str) -> Result<(MsgPosition, bool), WriteBufferError>;

    /// Called after `channel`'s checkpoint at `ts` has been published
    fn notify_checkpoint_updated(&self, channel: &str, ts: Timestamp);
}

impl<W: WriteBufferManager> WriteBufferManager for Arc<W> {
    fn get_checkpoint(&self, channel: &str) -> Result<(MsgPosition, bool), WriteBufferError> {
        (**self).get_checkpoint(channel)
    }

    fn notify_checkpoint_updated(&self, channel: &str, ts: Timestamp) {
        (**self).notify_checkpoint_updated(channel, ts)
    }
}

struct SegmentBuffer {
    partition_id: PartitionId,
    inserts: InsertBatch,
    deletes: DeleteBatch,
    /// Position of the first message buffered into this segment
    start_position: MsgPosition,
    ts_from: Timestamp,
    ts_to: Timestamp,
}

impl SegmentBuffer {
    fn new(partition_id: PartitionId, start_position: MsgPosition) -> Self {
        let ts = start_position.timestamp;
        SegmentBuffer {
            partition_id,
            inserts: InsertBatch::default(),
            deletes: DeleteBatch::default(),
            start_position,
            ts_from: ts,
            ts_to: ts,
        }
    }

    fn size_bytes(&self) -> usize {
        self.inserts.size_bytes() + self.deletes.size_bytes()
    }
}

struct ChannelBuffer {
    collection_id: CollectionId,
    schema: Arc<CollectionSchema>,
    segments: BTreeMap<SegmentId, SegmentBuffer>,
    /// End position of the last consumed message
    latest_position: MsgPosition,
    flush_ts: Option<Timestamp>,
    /// Last checkpoint reported through `notify_checkpoint_updated`
    published_ts: Option<Timestamp>,
}

/// In-memory write buffer feeding a `SyncManager`
pub struct BufferManager<P: Persister> {
    sync_mgr: Arc<SyncManager<P>>,
    max_segment_buffer_bytes: usize,
    task_kind: SyncTaskKind,
    channels: Arc<Mutex<HashMap<String, ChannelBuffer>>>,
}

impl<P: Persister> BufferManager<P> {
    pub fn new(sync_mgr: Arc<SyncManager<P>>, config: &WriteBufferConfig, task_kind: SyncTaskKind) -> Self {
        BufferManager {
            sync_mgr,
            max_segment_buffer_bytes: config.max_segment_buffer_bytes,
            task_kind,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager<P>> {
        &self.sync_mgr
    }

    /// Start tracking `channel`, consuming from `start`
    pub fn register_channel(
        &self,
        channel: &str,
        collection_id: CollectionId,
        schema: Arc<CollectionSchema>,
        start: MsgPosition,
    ) -> Result<(), WriteBufferError> {
        let mut channels = self.channels.lock();
        if channels.contains_key(channel) {
            return Err(WriteBufferError::ChannelExists(channel.to_string()));
        }
        info!(channel, collection_id, start_ts = %start.timestamp, "write buffer channel registered");
        channels.insert(
            channel.to_string(),
            ChannelBuffer {
                collection_id,
                schema,
                segments: BTreeMap::new(),
                latest_position: start,
                flush_ts: None,
                published_ts: None,
            },
        );
        Ok(())
    }

    /// Stop tracking `channel`, discarding unsynced data
    pub fn remove_channel(&self, channel: &str) -> Result<(), WriteBufferError> {
        let removed = self
            .channels
            .lock()
            .remove(channel)
            .ok_or_else(|| WriteBufferError::ChannelNotFound(channel.to_string()))?;
        info!(
            channel,
            dropped_segments = removed.segments.len(),
            "write buffer channel removed"
        );
        Ok(())
    }

    /// Buffer inserts consumed from messages between `start` and `end`
    ///
    /// Returns a handle when the segment crossed the size threshold and was
    /// synced.
    pub fn buffer_insert(
        &self,
        channel: &str,
        segment_id: SegmentId,
        partition_id: PartitionId,
        batch: InsertBatch,
        start: MsgPosition,
        end: MsgPosition,
    ) -> Result<Option<SyncHandle>, WriteBufferError> {
        self.buffer(channel, segment_id, partition_id, start, end, |buf| {
            buf.inserts.merge(batch)
        })
    }

    /// Buffer deletes consumed from messages between `start` and `end`
    pub fn buffer_delete(
        &self,
        channel: &str,
        segment_id: SegmentId,
        partition_id: PartitionId,
        batch: DeleteBatch,
        start: MsgPosition,
        end: MsgPosition,
    ) -> Result<Option<SyncHandle>, WriteBufferError> {
        self.buffer(channel, segment_id, partition_id, start, end, |buf| {
            buf.deletes.merge(batch)
        })
    }

    fn buffer<F>(
        &self,
        channel: &str,
        segment_id: SegmentId,
        partition_id: PartitionId,
        start: MsgPosition,
        end: MsgPosition,
        apply: F,
    ) -> Result<Option<SyncHandle>, WriteBufferError>
    where
        F: FnOnce(&mut SegmentBuffer),
    {
        let mut channels = self.channels.lock();
        let ch = channels
            .get_mut(channel)
            .ok_or_else(|| WriteBufferError::ChannelNotFound(channel.to_string()))?;

        let buf = ch
            .segments
            .entry(segment_id)
            .or_insert_with(|| SegmentBuffer::new(partition_id, start));
        apply(buf);
        if end.timestamp > buf.ts_to {
            buf.ts_to = end.timestamp;
        }
        let full = buf.size_bytes() >= self.max_segment_buffer_bytes;
        if end.is_newer_than(&ch.latest_position) {
            ch.latest_position = end;
        }

        if full {
            debug!(channel, segment_id, "segment buffer full, syncing");
            return self.sync_locked(channel, ch, segment_id);
        }
        Ok(None)
    }

    /// Sync one buffered segment now
    ///
    /// Returns `None` when there is nothing buffered for the segment, or when
    /// a task with the same checkpoint is still in flight (the data stays
    /// buffered for the next sync).
    pub fn sync_segment(
        &self,
        channel: &str,
        segment_id: SegmentId,
    ) -> Result<Option<SyncHandle>, WriteBufferError> {
        let mut channels = self.channels.lock();
        let ch = channels
            .get_mut(channel)
            .ok_or_else(|| WriteBufferError::ChannelNotFound(channel.to_string()))?;
        self.sync_locked(channel, ch, segment_id)
    }

    /// Sync every buffered segment of `channel`
    pub fn sync_channel(&self, channel: &str) -> Result<Vec<SyncHandle>, WriteBufferError> {
        let mut channels = self.channels.lock();
        let ch = channels
            .get_mut(channel)
            .ok_or_else(|| WriteBufferError::ChannelNotFound(channel.to_string()))?;
        let segment_ids: Vec<SegmentId> = ch.segments.keys().copied().collect();
        let mut handles = Vec::with_capacity(segment_ids.len());
        for segment_id in segment_ids {
            if let Some(handle) = self.sync_locked(channel, ch, segment_id)? {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    // Submission happens under the channel lock so the in-flight entry is
    // registered before the buffer disappears from `get_checkpoint`'s view.
    fn sync_locked(
        &self,
        channel: &str,
        ch: &mut ChannelBuffer,
        segment_id: SegmentId,
    ) -> Result<Option<SyncHandle>, WriteBufferError> {
        let key = TaskKey {
            segment_id,
            checkpoint_ts: ch.latest_position.timestamp,
        };
        if self.sync_mgr.in_flight_for(channel).contains(&key) {
            debug!(channel, %key, "sync with same checkpoint still in flight, keeping buffer");
            return Ok(None);
        }
        let Some(buf) = ch.segments.remove(&segment_id) else {
            return Ok(None);
        };

        let meta = SyncMeta {
            collection_id: ch.collection_id,
            partition_id: buf.partition_id,
            segment_id,
            channel_name: channel.to_string(),
            schema: ch.schema.clone(),
            checkpoint: ch.latest_position.clone(),
            start_position: Some(buf.start_position),
            ts_from: buf.ts_from,
            ts_to: buf.ts_to,
        };
        let payload = SyncPayload {
            inserts: (buf.inserts.row_count > 0).then_some(buf.inserts),
            deletes: (!buf.deletes.is_empty()).then_some(buf.deletes),
        };
        let task = SyncTask::new(self.task_kind, meta, payload)?;
        let channels = self.channels.clone();
        let handle = self.sync_mgr.submit_with_callback(task, move |task, result| {
            if result.is_err() {
                restore_failed(&channels, task);
            }
        })?;
        Ok(Some(handle))
    }

    /// Request a checkpoint publication once the checkpoint reaches `ts`
    pub fn set_flush_timestamp(&self, channel: &str, ts: Timestamp) -> Result<(), WriteBufferError> {
        let mut channels = self.channels.lock();
        let ch = channels
            .get_mut(channel)
            .ok_or_else(|| WriteBufferError::ChannelNotFound(channel.to_string()))?;
        ch.flush_ts = Some(ts);
        Ok(())
    }

    /// Segments with unsynced data on `channel`
    pub fn buffered_segments(&self, channel: &str) -> Vec<SegmentId> {
        self.channels
            .lock()
            .get(channel)
            .map(|ch| ch.segments.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Bytes buffered for `channel`
    pub fn buffered_bytes(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|ch| ch.segments.values().map(SegmentBuffer::size_bytes).sum())
            .unwrap_or(0)
    }

    /// Last checkpoint timestamp reported as published for `channel`
    pub fn published_checkpoint(&self, channel: &str) -> Option<Timestamp> {
        self.channels.lock().get(channel).and_then(|ch| ch.published_ts)
    }
}

/// Put a failed task's data back in front of whatever was buffered since
fn restore_failed(channels: &Mutex<HashMap<String, ChannelBuffer>>, task: &SyncTask) {
    let meta = task.meta();
    let mut channels = channels.lock();
    let Some(ch) = channels.get_mut(&meta.channel_name) else {
        warn!(
            channel = %meta.channel_name,
            segment_id = meta.segment_id,
            "channel removed, dropping data of failed sync"
        );
        return;
    };

    let start = meta
        .start_position
        .clone()
        .unwrap_or_else(|| meta.checkpoint.clone());
    let mut restored = SegmentBuffer::new(meta.partition_id, start);
    restored.ts_from = meta.ts_from;
    restored.ts_to = meta.ts_to;
    let payload = task.payload().clone();
    if let Some(inserts) = payload.inserts {
        restored.inserts = inserts;
    }
    if let Some(deletes) = payload.deletes {
        restored.deletes = deletes;
    }

    if let Some(newer) = ch.segments.remove(&meta.segment_id) {
        restored.inserts.merge(newer.inserts);
        restored.deletes.merge(newer.deletes);
        restored.ts_from = restored.ts_from.min(newer.ts_from);
        restored.ts_to = restored.ts_to.max(newer.ts_to);
        if newer.start_position.timestamp < restored.start_position.timestamp {
            restored.start_position = newer.start_position;
        }
    }
    debug!(
        channel = %meta.channel_name,
        segment_id = meta.segment_id,
        start_ts = %restored.start_position.timestamp,
        "sync failed, data returned to buffer"
    );
    ch.segments.insert(meta.segment_id, restored);
}

impl<P: Persister> WriteBufferManager for BufferManager<P> {
    fn get_checkpoint(&self, channel: &str) -> Result<(MsgPosition, bool), WriteBufferError> {
        let channels = self.channels.lock();
        let ch = channels
            .get(channel)
            .ok_or_else(|| WriteBufferError::ChannelNotFound(channel.to_string()))?;

        let buffered = ch
            .segments
            .values()
            .map(|s| &s.start_position)
            .min_by_key(|p| p.timestamp)
            .cloned();
        let in_flight = self
            .sync_mgr
            .get_earliest_position(channel)
            .map(|(_, position)| position);

        let checkpoint = earliest(buffered, in_flight).unwrap_or_else(|| ch.latest_position.clone());
        let needs_update = ch
            .flush_ts
            .is_some_and(|flush_ts| checkpoint.timestamp >= flush_ts);
        Ok((checkpoint, needs_update))
    }

    fn notify_checkpoint_updated(&self, channel: &str, ts: Timestamp) {
        let mut channels = self.channels.lock();
        let Some(ch) = channels.get_mut(channel) else {
            return;
        };
        ch.published_ts = Some(ch.published_ts.map_or(ts, |prev| prev.max(ts)));
        if ch.flush_ts.is_some_and(|flush_ts| ts >= flush_ts) {
            debug!(channel, %ts, "flush timestamp reached, cleared");
            ch.flush_ts = None;
        }
    }
}
