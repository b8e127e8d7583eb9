//! Per-key exclusion and the dispatcher built on it
//!
//! `KeyLock` hands out at most one guard per key at a time. Guards are owned
//! values, so they can be held across `.await` points and moved into spawned
//! tasks. Lock entries are created on first use and kept for the lifetime of
//! the lock; cardinality is bounded by the number of live keys.
//!
//! `KeyLockDispatcher` runs jobs on the tokio runtime with two gates:
//!
//! ```text
//! submit(key, job) ──► wait for previous job on key ──► KeyLock(key) ──► worker permit ──► job
//! ```
//!
//! The previous-job chain makes same-key jobs start in submission order.
//! The worker permit is taken last, so a key held by `block` never ties up
//! a worker slot.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Exclusive hold on one key. Dropping it releases the key.
pub struct KeyGuard<K> {
    key: K,
    _guard: OwnedMutexGuard<()>,
}

impl<K> KeyGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Debug> Debug for KeyGuard<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

/// Keyed mutual exclusion
pub struct KeyLock<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
    /// Guards held on behalf of external `block` callers
    blocked: Mutex<HashMap<K, KeyGuard<K>>>,
}

impl<K> Default for KeyLock<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyLock<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        KeyLock {
            locks: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &K) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(key.clone()).or_default().clone()
    }

    /// Wait until no other holder exists for `key`, then take it.
    /// Waiters are served in the order they started waiting.
    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let mutex = self.entry(&key);
        let guard = mutex.lock_owned().await;
        KeyGuard { key, _guard: guard }
    }

    /// Take `key` only if it is free right now
    pub fn try_lock(&self, key: K) -> Option<KeyGuard<K>> {
        let mutex = self.entry(&key);
        let guard = mutex.try_lock_owned().ok()?;
        Some(KeyGuard { key, _guard: guard })
    }

    /// Hold `key` until `unblock` is called. Waits for current holders first.
    /// Blocking an already blocked key waits for the matching `unblock`.
    pub async fn block(&self, key: K) {
        let guard = self.lock(key.clone()).await;
        debug!(?key, "key blocked");
        self.blocked.lock().insert(key, guard);
    }

    /// Release a hold taken by `block`. Returns false if the key was not blocked.
    pub fn unblock(&self, key: &K) -> bool {
        let guard = self.blocked.lock().remove(key);
        match guard {
            Some(guard) => {
                drop(guard);
                debug!(?key, "key unblocked");
                true
            }
            None => {
                warn!(?key, "unblock called on a key that is not blocked");
                false
            }
        }
    }

    pub fn is_blocked(&self, key: &K) -> bool {
        self.blocked.lock().contains_key(key)
    }

    /// Number of keys that have ever been locked
    pub fn key_count(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Runs jobs under a per-key lock on a bounded number of workers
pub struct KeyLockDispatcher<K> {
    key_lock: Arc<KeyLock<K>>,
    workers: Arc<Semaphore>,
    parallelism: usize,
    /// Completion signal of the most recently submitted job per key
    tails: Arc<Mutex<HashMap<K, (u64, oneshot::Receiver<()>)>>>,
    next_seq: AtomicU64,
}

impl<K> KeyLockDispatcher<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// `parallelism` must be at least 1; callers validate before constructing.
    pub fn new(parallelism: usize) -> Self {
        debug_assert!(parallelism > 0, "dispatcher parallelism must be positive");
        KeyLockDispatcher {
            key_lock: Arc::new(KeyLock::new()),
            workers: Arc::new(Semaphore::new(parallelism)),
            parallelism,
            tails: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn key_lock(&self) -> &Arc<KeyLock<K>> {
        &self.key_lock
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Worker slots not currently running a job
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Schedule `job` for `key`. Must be called from within a tokio runtime.
    ///
    /// The key is held for the whole job; the returned handle resolves after
    /// the key and the worker slot have been released.
    pub fn submit<F, T>(&self, key: K, job: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let prev = self
            .tails
            .lock()
            .insert(key.clone(), (seq, done_rx))
            .map(|(_, rx)| rx);

        let key_lock = self.key_lock.clone();
        let workers = self.workers.clone();
        let tails = self.tails.clone();

        tokio::spawn(async move {
            if let Some(prev) = prev {
                // Err means the previous job's sender was dropped, which is also completion
                let _ = prev.await;
            }

            let guard = key_lock.lock(key.clone()).await;
            let permit = workers.acquire_owned().await;
            debug_assert!(permit.is_ok(), "worker semaphore is never closed");

            let output = job.await;

            drop(permit);
            drop(guard);
            {
                let mut tails = tails.lock();
                if tails.get(&key).map(|(s, _)| *s) == Some(seq) {
                    tails.remove(&key);
                }
            }
            drop(done_tx);
            output
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_is_exclusive_per_key() {
        let lock = KeyLock::<i64>::new();

        let g1 = lock.lock(1).await;
        assert!(lock.try_lock(1).is_none());
        // Other keys are independent
        assert!(lock.try_lock(2).is_some());

        drop(g1);
        assert!(lock.try_lock(1).is_some());
    }

    #[tokio::test]
    async fn test_block_and_unblock() {
        let lock = KeyLock::<i64>::new();

        lock.block(7).await;
        assert!(lock.is_blocked(&7));
        assert!(lock.try_lock(7).is_none());

        assert!(lock.unblock(&7));
        assert!(!lock.is_blocked(&7));
        assert!(lock.try_lock(7).is_some());
    }

    #[tokio::test]
    async fn test_unblock_without_block_is_noop() {
        let lock = KeyLock::<i64>::new();
        assert!(!lock.unblock(&3));
        assert!(lock.try_lock(3).is_some());
    }

    #[tokio::test]
    async fn test_entries_created_lazily() {
        let lock = KeyLock::<i64>::new();
        assert_eq!(lock.key_count(), 0);
        let _g = lock.lock(1).await;
        let _h = lock.lock(2).await;
        assert_eq!(lock.key_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dispatcher_serializes_same_key() {
        let dispatcher = KeyLockDispatcher::<i64>::new(4);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(dispatcher.submit(42, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dispatcher_same_key_fifo() {
        let dispatcher = KeyLockDispatcher::<i64>::new(4);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..20 {
            let order = order.clone();
            handles.push(dispatcher.submit(1, async move {
                tokio::task::yield_now().await;
                order.lock().push(i);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dispatcher_bounds_parallelism() {
        let dispatcher = KeyLockDispatcher::<i64>::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for key in 0..8 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(dispatcher.submit(key, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(dispatcher.idle_workers(), 2);
    }

    #[tokio::test]
    async fn test_blocked_key_does_not_hold_worker() {
        let dispatcher = KeyLockDispatcher::<i64>::new(1);
        dispatcher.key_lock().block(1).await;

        let blocked = dispatcher.submit(1, async { "blocked" });
        let free = dispatcher.submit(2, async { "free" });

        // Single worker, yet the other key proceeds
        assert_eq!(free.await.unwrap(), "free");
        assert!(!blocked.is_finished());

        dispatcher.key_lock().unblock(&1);
        assert_eq!(blocked.await.unwrap(), "blocked");
    }
}
