//! Sync Manager
//!
//! Accepts sync tasks and runs them through a `KeyLockDispatcher` keyed by
//! segment id: tasks for one segment run one at a time in submission order,
//! tasks for different segments run in parallel up to `parallel_task`.
//!
//! ```text
//! submit(task) ──► registry.insert(key) ──► dispatcher(segment) ──► persist ──► registry.remove(key)
//!                                                                                    │
//!        SyncHandle ◄────────────────────── result ◄── segment lock released ◄────────┘
//! ```
//!
//! The registry of in-flight tasks answers `get_earliest_position`: the
//! lowest start position among unfinished tasks of a channel. Channel
//! checkpoints must not move past it.

use crate::config::SyncManagerConfig;
use crate::syncmgr::key_lock::KeyLockDispatcher;
use crate::syncmgr::persist::{PersistError, Persister};
use crate::syncmgr::position::MsgPosition;
use crate::syncmgr::task::{SegmentId, SyncTask, TaskKey};
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Error type for sync operations
#[derive(Debug)]
pub enum SyncError {
    /// `parallel_task` must be at least 1
    InvalidParallelism(usize),
    /// A task with the same segment id and checkpoint timestamp is in flight
    DuplicateTask(TaskKey),
    /// Task failed construction-time validation
    InvalidTask(String),
    /// Persistence step failed
    Persist(PersistError),
    /// Persistence step panicked
    Panicked(String),
    /// Worker was cancelled before producing a result
    Aborted(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::InvalidParallelism(n) => {
                write!(f, "parallel task number must be positive, got {}", n)
            }
            SyncError::DuplicateTask(key) => write!(f, "sync task {} already in flight", key),
            SyncError::InvalidTask(msg) => write!(f, "Invalid sync task: {}", msg),
            SyncError::Persist(e) => write!(f, "Persist failed: {}", e),
            SyncError::Panicked(msg) => write!(f, "Sync task panicked: {}", msg),
            SyncError::Aborted(msg) => write!(f, "Sync task aborted: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Persist(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistError> for SyncError {
    fn from(e: PersistError) -> Self {
        SyncError::Persist(e)
    }
}

/// Completion handle for a submitted task. Resolves exactly once.
#[derive(Debug)]
pub struct SyncHandle {
    key: TaskKey,
    inner: JoinHandle<Result<(), SyncError>>,
}

impl SyncHandle {
    pub fn key(&self) -> TaskKey {
        self.key
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl Future for SyncHandle {
    type Output = Result<(), SyncError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(SyncError::Aborted(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

type TaskRegistry = Arc<RwLock<HashMap<TaskKey, Arc<SyncTask>>>>;

/// Runs once per task with its outcome, before the registry entry is removed
pub type SyncCallback = Box<dyn FnOnce(&SyncTask, &Result<(), SyncError>) + Send + 'static>;

/// Removes the registry entry on every exit path, unwinding included
struct InFlightGuard {
    tasks: TaskRegistry,
    key: TaskKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tasks.write().remove(&self.key);
    }
}

/// Counters for submitted and finished tasks
#[derive(Debug, Default)]
struct SyncCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: usize,
}

/// Coordinates segment sync tasks
pub struct SyncManager<P: Persister> {
    dispatcher: KeyLockDispatcher<SegmentId>,
    persister: Arc<P>,
    tasks: TaskRegistry,
    counters: Arc<SyncCounters>,
}

impl<P: Persister> SyncManager<P> {
    pub fn new(config: &SyncManagerConfig, persister: P) -> Result<Self, SyncError> {
        if config.parallel_task < 1 {
            return Err(SyncError::InvalidParallelism(config.parallel_task));
        }
        info!(parallel_task = config.parallel_task, "sync manager started");
        Ok(SyncManager {
            dispatcher: KeyLockDispatcher::new(config.parallel_task),
            persister: Arc::new(persister),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(SyncCounters::default()),
        })
    }

    pub fn persister(&self) -> &Arc<P> {
        &self.persister
    }

    /// Register and schedule `task`. Must be called from within a tokio runtime.
    ///
    /// Fails synchronously if a task with the same key is already in flight.
    pub fn submit(&self, task: SyncTask) -> Result<SyncHandle, SyncError> {
        self.submit_inner(task, None)
    }

    /// Like `submit`, with `on_done` run on completion while the task still
    /// counts as in flight. Whatever `on_done` records is visible before the
    /// task leaves `get_earliest_position`.
    pub fn submit_with_callback<F>(&self, task: SyncTask, on_done: F) -> Result<SyncHandle, SyncError>
    where
        F: FnOnce(&SyncTask, &Result<(), SyncError>) + Send + 'static,
    {
        self.submit_inner(task, Some(Box::new(on_done)))
    }

    fn submit_inner(&self, task: SyncTask, on_done: Option<SyncCallback>) -> Result<SyncHandle, SyncError> {
        let key = task.key();
        let task = Arc::new(task);
        {
            let mut tasks = self.tasks.write();
            if tasks.contains_key(&key) {
                return Err(SyncError::DuplicateTask(key));
            }
            tasks.insert(key, task.clone());
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(%key, channel = task.channel_name(), "sync task submitted");

        let guard = InFlightGuard {
            tasks: self.tasks.clone(),
            key,
        };
        let persister = self.persister.clone();
        let counters = self.counters.clone();

        let inner = self.dispatcher.submit(key.segment_id, async move {
            let outcome = AssertUnwindSafe(task.execute(&*persister)).catch_unwind().await;
            let result = match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(SyncError::Persist(e)),
                Err(panic) => Err(SyncError::Panicked(panic_message(panic.as_ref()))),
            };
            if let Some(on_done) = on_done {
                on_done(task.as_ref(), &result);
            }
            // Registry removal happens while the segment is still held
            drop(guard);

            match &result {
                Ok(()) => {
                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(%key, "sync task done");
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(%key, error = %e, "sync task failed");
                }
            }
            result
        });

        Ok(SyncHandle { key, inner })
    }

    /// Earliest start position among in-flight tasks of `channel`, with its segment
    ///
    /// `None` means no task for the channel is in flight, which is different
    /// from a floor at timestamp zero.
    pub fn get_earliest_position(&self, channel: &str) -> Option<(SegmentId, MsgPosition)> {
        let tasks = self.tasks.read();
        tasks
            .values()
            .filter(|t| t.channel_name() == channel)
            .filter_map(|t| t.start_position().map(|p| (t.segment_id(), p)))
            .min_by_key(|(_, p)| p.timestamp)
            .map(|(segment_id, p)| (segment_id, p.clone()))
    }

    /// Exclude ordinary sync tasks from `segment_id` until `unblock`.
    /// Waits for a running task on the segment to finish.
    pub async fn block(&self, segment_id: SegmentId) {
        self.dispatcher.key_lock().block(segment_id).await;
    }

    pub fn unblock(&self, segment_id: SegmentId) {
        self.dispatcher.key_lock().unblock(&segment_id);
    }

    pub fn is_blocked(&self, segment_id: SegmentId) -> bool {
        self.dispatcher.key_lock().is_blocked(&segment_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Keys of in-flight tasks on `channel`, sorted
    pub fn in_flight_for(&self, channel: &str) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self
            .tasks
            .read()
            .iter()
            .filter(|(_, t)| t.channel_name() == channel)
            .map(|(k, _)| *k)
            .collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight_count(),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
