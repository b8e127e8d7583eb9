//! Sync Manager Integration Tests
//!
//! Segment serialization, external blocking and the in-flight checkpoint
//! floor, driven through the public API with a gated persister.

use datanode_sync::config::SyncManagerConfig;
use datanode_sync::syncmgr::{
    CollectionSchema, MsgPosition, PersistFuture, Persister, SegmentId, SyncManager, SyncMeta,
    SyncPayload, SyncTask, TaskKey,
};
use datanode_sync::tso::Timestamp;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Records start/end events and waits for a gate permit before finishing
#[derive(Clone)]
struct GatedPersister {
    events: Arc<Mutex<Vec<String>>>,
    gate: Arc<Semaphore>,
}

impl GatedPersister {
    fn new() -> Self {
        GatedPersister {
            events: Arc::new(Mutex::new(Vec::new())),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl Persister for GatedPersister {
    fn persist<'a>(&'a self, task: &'a SyncTask) -> PersistFuture<'a> {
        Box::pin(async move {
            let cp = task.checkpoint().timestamp.as_u64();
            self.events.lock().push(format!("start-{}-{}", task.segment_id(), cp));
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.events.lock().push(format!("end-{}-{}", task.segment_id(), cp));
            Ok(())
        })
    }
}

fn schema() -> Arc<CollectionSchema> {
    Arc::new(CollectionSchema {
        name: "test".to_string(),
        fields: Vec::new(),
    })
}

fn task(channel: &str, segment_id: SegmentId, start_ts: u64, cp_ts: u64) -> SyncTask {
    let meta = SyncMeta {
        collection_id: 1,
        partition_id: 1,
        segment_id,
        channel_name: channel.to_string(),
        schema: schema(),
        checkpoint: MsgPosition::new(channel, Timestamp(cp_ts)),
        start_position: Some(MsgPosition::new(channel, Timestamp(start_ts))),
        ts_from: Timestamp(start_ts),
        ts_to: Timestamp(cp_ts),
    };
    SyncTask::legacy(meta, SyncPayload::default()).unwrap()
}

fn manager(parallel_task: usize, persister: GatedPersister) -> SyncManager<GatedPersister> {
    let config = SyncManagerConfig {
        parallel_task,
        ..SyncManagerConfig::default()
    };
    SyncManager::new(&config, persister).unwrap()
}

async fn wait_for_event(persister: &GatedPersister, event: &str) {
    for _ in 0..200 {
        if persister.events().iter().any(|e| e == event) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("event {} never happened, got {:?}", event, persister.events());
}

#[tokio::test]
async fn test_same_segment_tasks_run_in_submission_order() {
    let persister = GatedPersister::new();
    let mgr = manager(1, persister.clone());

    let first = mgr.submit(task("ch1", 7, 50, 100)).unwrap();
    let second = mgr.submit(task("ch1", 7, 150, 200)).unwrap();

    wait_for_event(&persister, "start-7-100").await;
    assert_eq!(mgr.in_flight_for("ch1").len(), 2);

    persister.gate.add_permits(1);
    wait_for_event(&persister, "start-7-200").await;

    // task(100) is done and deregistered before task(200) starts
    assert_eq!(
        persister.events(),
        vec!["start-7-100", "end-7-100", "start-7-200"]
    );
    assert_eq!(
        mgr.in_flight_for("ch1"),
        vec![TaskKey {
            segment_id: 7,
            checkpoint_ts: Timestamp(200)
        }]
    );

    persister.gate.add_permits(1);
    first.await.unwrap();
    second.await.unwrap();
    assert_eq!(mgr.in_flight_count(), 0);
}

#[tokio::test]
async fn test_blocked_segment_waits_for_unblock() {
    let persister = GatedPersister::new();
    persister.gate.add_permits(10);
    let mgr = manager(2, persister.clone());

    mgr.block(7).await;
    assert!(mgr.is_blocked(7));
    let mut handle = mgr.submit(task("ch1", 7, 10, 20)).unwrap();

    let pending = tokio::time::timeout(Duration::from_millis(100), &mut handle).await;
    assert!(pending.is_err(), "task ran while segment was blocked");
    assert!(persister.events().is_empty());

    mgr.unblock(7);
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("task did not resume after unblock")
        .unwrap();
}

#[tokio::test]
async fn test_no_in_flight_tasks_means_no_floor() {
    let persister = GatedPersister::new();
    let mgr = manager(2, persister);
    assert!(mgr.get_earliest_position("ch1").is_none());
}

#[tokio::test]
async fn test_block_waits_for_running_task() {
    let persister = GatedPersister::new();
    let mgr = Arc::new(manager(2, persister.clone()));

    let handle = mgr.submit(task("ch1", 7, 10, 20)).unwrap();
    wait_for_event(&persister, "start-7-20").await;

    let blocker = {
        let mgr = mgr.clone();
        tokio::spawn(async move { mgr.block(7).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocker.is_finished());

    persister.gate.add_permits(1);
    handle.await.unwrap();
    blocker.await.unwrap();
    assert!(mgr.is_blocked(7));
    mgr.unblock(7);
}

#[tokio::test]
async fn test_different_segments_run_in_parallel() {
    let persister = GatedPersister::new();
    let mgr = manager(2, persister.clone());

    let a = mgr.submit(task("ch1", 1, 10, 20)).unwrap();
    let b = mgr.submit(task("ch1", 2, 30, 40)).unwrap();
    wait_for_event(&persister, "start-1-20").await;
    wait_for_event(&persister, "start-2-40").await;

    persister.gate.add_permits(2);
    a.await.unwrap();
    b.await.unwrap();
}

#[tokio::test]
async fn test_blocked_segment_does_not_starve_others() {
    let persister = GatedPersister::new();
    persister.gate.add_permits(10);
    let mgr = manager(1, persister.clone());

    mgr.block(7).await;
    let blocked = mgr.submit(task("ch1", 7, 10, 20)).unwrap();
    // Single worker, yet segment 8 still runs
    let other = mgr.submit(task("ch1", 8, 30, 40)).unwrap();
    tokio::time::timeout(Duration::from_secs(1), other)
        .await
        .expect("unrelated segment starved by a blocked one")
        .unwrap();

    mgr.unblock(7);
    blocked.await.unwrap();
}

#[tokio::test]
async fn test_earliest_position_is_lower_bound_per_channel() {
    let persister = GatedPersister::new();
    let mgr = manager(4, persister.clone());

    let handles = vec![
        mgr.submit(task("ch1", 1, 300, 310)).unwrap(),
        mgr.submit(task("ch1", 2, 200, 320)).unwrap(),
        mgr.submit(task("ch2", 3, 100, 330)).unwrap(),
    ];

    let (segment_id, pos) = mgr.get_earliest_position("ch1").unwrap();
    assert_eq!(segment_id, 2);
    assert_eq!(pos.timestamp, Timestamp(200));
    let (segment_id, pos) = mgr.get_earliest_position("ch2").unwrap();
    assert_eq!(segment_id, 3);
    assert_eq!(pos.timestamp, Timestamp(100));

    persister.gate.add_permits(3);
    for h in handles {
        h.await.unwrap();
    }
    assert!(mgr.get_earliest_position("ch1").is_none());
    assert!(mgr.get_earliest_position("ch2").is_none());
    assert_eq!(mgr.stats().succeeded, 3);
}
