//! Channel Checkpoint Updater
//!
//! Publishes per-channel checkpoints to durable storage without ever
//! blocking the caller. A single actor owns all publication, so the
//! published position of a channel only moves forward.
//!
//! ## Architecture
//!
//! ```text
//! TtNode ch1 ──┐
//! TtNode ch2 ──┤──► CheckpointUpdater ──► pending (newest per channel) ──► CheckpointStore::publish
//! TtNode ch3 ──┘            │                                                  │
//!                           └──────── published map ◄── ok ◄───────────────────┘
//!                                         (failures retry with backoff)
//! ```
//!
//! ## Coalescing
//!
//! Each channel has one pending slot holding one position and one callback.
//! A newer position replaces the pending one together with its callback; the
//! superseded callback is dropped without running, so a long publish outage
//! holds a single closure per channel. An update older than the pending one
//! is dropped the same way. An update that is not newer than the published
//! position never reaches the store and its callback runs right away.

use crate::chunk_store::ChunkStore;
use crate::syncmgr::MsgPosition;
use futures::future::join_all;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CheckpointUpdaterConfig;

/// Error type for checkpoint publication
#[derive(Debug)]
pub enum CheckpointError {
    /// Storage I/O failure
    Io(std::io::Error),
    /// Publish did not finish within the configured timeout
    Timeout(Duration),
    /// Serialization failure
    Serialization(String),
    /// Store refused the update
    Rejected(String),
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::Io(e) => write!(f, "I/O error: {}", e),
            CheckpointError::Timeout(d) => write!(f, "publish timed out after {:?}", d),
            CheckpointError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            CheckpointError::Rejected(msg) => write!(f, "Checkpoint rejected: {}", msg),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        CheckpointError::Io(e)
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(e: serde_json::Error) -> Self {
        CheckpointError::Serialization(e.to_string())
    }
}

pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + 'a>>;

/// Durable checkpoint store. `publish` must be idempotent under retry.
pub trait CheckpointStore: Send + Sync + 'static {
    fn publish<'a>(&'a self, channel: &'a str, position: &'a MsgPosition) -> PublishFuture<'a>;
}

/// Stores each channel checkpoint as a JSON object at `{root}/channel_cp/{channel}`
pub struct ChunkStoreCheckpointStore<S: ChunkStore> {
    store: S,
    root: String,
}

impl<S: ChunkStore> ChunkStoreCheckpointStore<S> {
    pub fn new(store: S, root: impl Into<String>) -> Self {
        ChunkStoreCheckpointStore {
            store,
            root: root.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn key(&self, channel: &str) -> String {
        format!("{}/channel_cp/{}", self.root, channel)
    }

    /// Read back the last published checkpoint of `channel`
    pub async fn load(&self, channel: &str) -> Result<Option<MsgPosition>, CheckpointError> {
        match self.store.get(&self.key(channel)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl<S: ChunkStore> CheckpointStore for ChunkStoreCheckpointStore<S> {
    fn publish<'a>(&'a self, channel: &'a str, position: &'a MsgPosition) -> PublishFuture<'a> {
        Box::pin(async move {
            let data = serde_json::to_vec(position)?;
            self.store.put(&self.key(channel), &data).await?;
            Ok(())
        })
    }
}

/// Runs once the update it was attached to is durable
pub type UpdateCallback = Box<dyn FnOnce() + Send + 'static>;

/// Messages for the updater actor
enum UpdaterMessage {
    Update {
        channel: String,
        position: MsgPosition,
        on_success: UpdateCallback,
    },
    RemoveChannel {
        channel: String,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

enum Flow {
    Continue,
    Shutdown(oneshot::Sender<()>),
}

struct PendingUpdate {
    position: MsgPosition,
    on_success: UpdateCallback,
    /// Failed attempts for the current position lineage
    attempts: u32,
    next_attempt: Instant,
}

#[derive(Debug, Default)]
struct UpdaterCounters {
    published: AtomicU64,
    failures: AtomicU64,
    coalesced: AtomicU64,
    skipped: AtomicU64,
    pending: AtomicUsize,
}

/// Snapshot of updater counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdaterStats {
    /// Successful publish calls
    pub published: u64,
    /// Failed publish attempts (each retry counts)
    pub failures: u64,
    /// Updates merged into an already pending slot
    pub coalesced: u64,
    /// Updates that were not newer than the published position
    pub skipped: u64,
    /// Channels waiting for publication
    pub pending: usize,
}

type PublishedMap = Arc<RwLock<HashMap<String, MsgPosition>>>;

/// Actor that owns checkpoint publication
pub struct CheckpointUpdater<C: CheckpointStore> {
    store: Arc<C>,
    config: CheckpointUpdaterConfig,
    rx: mpsc::UnboundedReceiver<UpdaterMessage>,
    pending: HashMap<String, PendingUpdate>,
    published: PublishedMap,
    counters: Arc<UpdaterCounters>,
}

impl<C: CheckpointStore> CheckpointUpdater<C> {
    /// Run the actor loop until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            let sleep_target = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            let flow = tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break,
                },
                _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                    // Fold everything already queued into the pending slots first
                    let flow = self.drain_inbox();
                    if matches!(flow, Flow::Continue) {
                        self.publish_due(false).await;
                    }
                    flow
                }
            };

            if let Flow::Shutdown(response_tx) = flow {
                self.publish_due(true).await;
                info!(pending = self.pending.len(), "checkpoint updater shutting down");
                let _ = response_tx.send(());
                return;
            }
        }

        self.publish_due(true).await;
        info!("checkpoint updater stopped, all handles dropped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.next_attempt).min()
    }

    fn drain_inbox(&mut self) -> Flow {
        while let Ok(msg) = self.rx.try_recv() {
            if let Flow::Shutdown(tx) = self.handle_message(msg) {
                return Flow::Shutdown(tx);
            }
        }
        Flow::Continue
    }

    fn handle_message(&mut self, msg: UpdaterMessage) -> Flow {
        match msg {
            UpdaterMessage::Update {
                channel,
                position,
                on_success,
            } => {
                self.enqueue(channel, position, on_success);
                Flow::Continue
            }
            UpdaterMessage::RemoveChannel { channel } => {
                self.pending.remove(&channel);
                self.published.write().remove(&channel);
                self.counters.pending.store(self.pending.len(), Ordering::Relaxed);
                info!(%channel, "channel checkpoint state removed");
                Flow::Continue
            }
            UpdaterMessage::Shutdown { response_tx } => Flow::Shutdown(response_tx),
        }
    }

    fn enqueue(&mut self, channel: String, position: MsgPosition, on_success: UpdateCallback) {
        let stale = self
            .published
            .read()
            .get(&channel)
            .is_some_and(|published| !position.is_newer_than(published));
        if stale {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            on_success();
            return;
        }

        let now = Instant::now();
        match self.pending.entry(channel) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                // Ties go to the latest caller
                if !pending.position.is_newer_than(&position) {
                    pending.position = position;
                    pending.on_success = on_success;
                }
                if pending.attempts == 0 {
                    pending.next_attempt = now;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingUpdate {
                    position,
                    on_success,
                    attempts: 0,
                    next_attempt: now,
                });
            }
        }
        self.counters.pending.store(self.pending.len(), Ordering::Relaxed);
    }

    /// Publish every due slot (or every slot when `force`), bounded per round
    async fn publish_due(&mut self, force: bool) {
        let now = Instant::now();
        let mut due: Vec<(String, MsgPosition)> = self
            .pending
            .iter()
            .filter(|(_, p)| force || p.next_attempt <= now)
            .map(|(channel, p)| (channel.clone(), p.position.clone()))
            .collect();
        if due.is_empty() {
            return;
        }
        due.sort_by(|a, b| a.0.cmp(&b.0));

        let store = self.store.clone();
        let timeout = self.config.publish_timeout;
        for chunk in due.chunks(self.config.max_concurrent_publishes.max(1)) {
            let results = join_all(chunk.iter().map(|(channel, position)| {
                let store = store.clone();
                async move {
                    match tokio::time::timeout(timeout, store.publish(channel, position)).await {
                        Ok(result) => result,
                        Err(_) => Err(CheckpointError::Timeout(timeout)),
                    }
                }
            }))
            .await;

            for ((channel, position), result) in chunk.iter().zip(results) {
                self.complete(channel, position, result);
            }
        }
        self.counters.pending.store(self.pending.len(), Ordering::Relaxed);
    }

    fn complete(&mut self, channel: &str, position: &MsgPosition, result: Result<(), CheckpointError>) {
        match result {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                {
                    let mut published = self.published.write();
                    let advance = published
                        .get(channel)
                        .map_or(true, |current| position.is_newer_than(current));
                    if advance {
                        published.insert(channel.to_string(), position.clone());
                    }
                }
                if let Some(pending) = self.pending.remove(channel) {
                    debug!(channel, cp_ts = %position.timestamp, "channel checkpoint published");
                    (pending.on_success)();
                }
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                if let Some(pending) = self.pending.get_mut(channel) {
                    pending.attempts = pending.attempts.saturating_add(1);
                    let delay = backoff_delay(&self.config, pending.attempts);
                    pending.next_attempt = Instant::now() + delay;
                    warn!(
                        channel,
                        cp_ts = %position.timestamp,
                        attempts = pending.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "channel checkpoint publish failed, will retry"
                    );
                }
            }
        }
    }
}

/// Exponential backoff with jitter in [50%, 100%] of the nominal delay
fn backoff_delay(config: &CheckpointUpdaterConfig, attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(20);
    let nominal = config
        .backoff_initial
        .saturating_mul(1u32 << exp)
        .min(config.backoff_max);
    let factor = rand::thread_rng().gen_range(0.5..=1.0);
    nominal.mul_f64(factor).max(Duration::from_millis(1))
}

/// Handle for submitting updates to the updater actor
#[derive(Clone)]
pub struct CheckpointUpdaterHandle {
    tx: mpsc::UnboundedSender<UpdaterMessage>,
    published: PublishedMap,
    counters: Arc<UpdaterCounters>,
}

impl CheckpointUpdaterHandle {
    /// Request that `channel`'s checkpoint advance to `position`. Never blocks.
    ///
    /// Returns true if the update was queued for publication. A position that
    /// is not newer than the published one is a no-op and `on_success` runs
    /// immediately.
    pub fn update<F>(&self, channel: &str, position: MsgPosition, on_success: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let stale = self
            .published
            .read()
            .get(channel)
            .is_some_and(|published| !position.is_newer_than(published));
        if stale {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            on_success();
            return false;
        }

        let sent = self
            .tx
            .send(UpdaterMessage::Update {
                channel: channel.to_string(),
                position,
                on_success: Box::new(on_success),
            })
            .is_ok();
        if !sent {
            warn!(channel, "checkpoint updater unavailable, update dropped");
        }
        sent
    }

    /// Last published checkpoint of `channel`
    pub fn get(&self, channel: &str) -> Option<MsgPosition> {
        self.published.read().get(channel).cloned()
    }

    /// Forget a channel's pending and published state
    pub fn remove_channel(&self, channel: &str) {
        let _ = self.tx.send(UpdaterMessage::RemoveChannel {
            channel: channel.to_string(),
        });
    }

    pub fn stats(&self) -> UpdaterStats {
        UpdaterStats {
            published: self.counters.published.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            pending: self.counters.pending.load(Ordering::Relaxed),
        }
    }

    /// Make one last publish attempt for everything pending, then stop
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(UpdaterMessage::Shutdown { response_tx }).is_ok() {
            let _ = response_rx.await;
        }
    }
}

/// Spawn an updater with no previously published checkpoints
pub fn spawn_checkpoint_updater<C: CheckpointStore>(
    store: C,
    config: CheckpointUpdaterConfig,
) -> (CheckpointUpdaterHandle, tokio::task::JoinHandle<()>) {
    spawn_checkpoint_updater_with(store, config, HashMap::new())
}

/// Spawn an updater seeded with checkpoints recovered from the store
pub fn spawn_checkpoint_updater_with<C: CheckpointStore>(
    store: C,
    config: CheckpointUpdaterConfig,
    recovered: HashMap<String, MsgPosition>,
) -> (CheckpointUpdaterHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let published: PublishedMap = Arc::new(RwLock::new(recovered));
    let counters = Arc::new(UpdaterCounters::default());

    let actor = CheckpointUpdater {
        store: Arc::new(store),
        config,
        rx,
        pending: HashMap::new(),
        published: published.clone(),
        counters: counters.clone(),
    };
    let task = tokio::spawn(actor.run());

    let handle = CheckpointUpdaterHandle {
        tx,
        published,
        counters,
    };
    (handle, task)
}
