//! Data node sync pipeline demo
//!
//! Feeds synthetic inserts for one channel through the write buffer, sync
//! manager and time tick stage, publishing channel checkpoints to the
//! configured chunk store.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | DATANODE_CONFIG | - | Path to a TOML config file |
//! | DATANODE_CHANNEL | by-dev-dml_0 | Channel to simulate |
//! | DATANODE_BATCHES | 200 | Number of time ticks to generate |
//!
//! Plus the `DATANODE_*` overrides listed in `config`.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use datanode_sync::checkpoint::{spawn_checkpoint_updater_with, ChunkStoreCheckpointStore};
use datanode_sync::chunk_store::{ChunkStore, InMemoryChunkStore, LocalFsChunkStore};
use datanode_sync::config::{ChunkStoreType, DataNodeConfig};
use datanode_sync::flowgraph::{spawn_node, FlowGraphMsg, TtNode};
use datanode_sync::observability::init_tracing;
use datanode_sync::syncmgr::{
    ChunkStorePersister, CollectionSchema, DataType, FieldSchema, InsertBatch, MsgPosition,
    SegmentId, SyncManager,
};
use datanode_sync::tso::Timestamp;
use datanode_sync::writebuffer::BufferManager;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const DEFAULT_CHANNEL: &str = "by-dev-dml_0";
const DEFAULT_BATCHES: u64 = 200;
const SEGMENTS: [SegmentId; 3] = [1001, 1002, 1003];
const ROWS_PER_BATCH: u64 = 64;
const TICK_MS: u64 = 10;
const SYNC_EVERY: u64 = 25;

fn load_config() -> Result<DataNodeConfig, Box<dyn Error>> {
    let mut config = match std::env::var("DATANODE_CONFIG") {
        Ok(path) => DataNodeConfig::from_file(path)?,
        Err(_) => DataNodeConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn demo_schema() -> Arc<CollectionSchema> {
    Arc::new(CollectionSchema {
        name: "demo".to_string(),
        fields: vec![
            FieldSchema {
                field_id: 100,
                name: "id".to_string(),
                data_type: DataType::Int64,
                is_primary_key: true,
            },
            FieldSchema {
                field_id: 101,
                name: "embedding".to_string(),
                data_type: DataType::FloatVector { dim: 8 },
                is_primary_key: false,
            },
        ],
    })
}

fn demo_batch(batch_no: u64) -> InsertBatch {
    let ids: Vec<u8> = (0..ROWS_PER_BATCH)
        .flat_map(|i| (batch_no * ROWS_PER_BATCH + i).to_le_bytes())
        .collect();
    let vectors = vec![0u8; (ROWS_PER_BATCH * 8 * 4) as usize];
    InsertBatch::new(ROWS_PER_BATCH)
        .with_column(100, ids)
        .with_column(101, vectors)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = load_config()?;
    init_tracing(&config.log)?;

    info!(
        parallel_task = config.sync.parallel_task,
        storage_v2 = config.sync.storage_v2,
        store = ?config.store.store_type,
        "starting data node sync demo"
    );

    match config.store.store_type {
        ChunkStoreType::InMemory => run(Arc::new(InMemoryChunkStore::new()), config).await,
        ChunkStoreType::LocalFs => {
            let path = config
                .store
                .local_path
                .clone()
                .ok_or("store.local_path is required for localfs")?;
            run(Arc::new(LocalFsChunkStore::new(path)), config).await
        }
    }
}

async fn run<S: ChunkStore>(store: Arc<S>, config: DataNodeConfig) -> Result<(), Box<dyn Error>> {
    let channel = std::env::var("DATANODE_CHANNEL").unwrap_or_else(|_| DEFAULT_CHANNEL.to_string());
    let batches: u64 = std::env::var("DATANODE_BATCHES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_BATCHES);
    let root = config.store.root_path.clone();

    let persister = ChunkStorePersister::new(store.clone(), root.clone());
    let sync_mgr = Arc::new(SyncManager::new(&config.sync, persister)?);
    let buffer = Arc::new(BufferManager::new(
        sync_mgr.clone(),
        &config.write_buffer,
        config.sync.task_kind(),
    ));

    let cp_store = ChunkStoreCheckpointStore::new(store.clone(), root);
    let recovered = cp_store.load(&channel).await?;
    let start = match &recovered {
        Some(position) => {
            info!(%channel, cp_ts = %position.timestamp, "recovered channel checkpoint");
            position.clone()
        }
        None => MsgPosition::new(channel.as_str(), Timestamp::now()),
    };
    let mut seeded = HashMap::new();
    if let Some(position) = recovered {
        seeded.insert(channel.clone(), position);
    }
    let (updater, updater_task) =
        spawn_checkpoint_updater_with(cp_store, config.checkpoint.clone(), seeded);

    buffer.register_channel(&channel, 1, demo_schema(), start.clone())?;

    let (tick_tx, tick_rx) = mpsc::channel(64);
    let tt = TtNode::new(channel.as_str(), buffer.clone(), updater.clone(), &config.tt_node);
    let tt_task = spawn_node(tt, tick_rx, None);

    let mut sync_handles = Vec::new();
    let mut last = start;
    for batch_no in 0..batches {
        let begin = last.clone();
        let end_ts = Timestamp::compose(begin.timestamp.physical_millis() + TICK_MS, 0);
        let end = MsgPosition::new(channel.as_str(), end_ts);
        let segment_id = SEGMENTS[(batch_no % SEGMENTS.len() as u64) as usize];

        let batch = demo_batch(batch_no);
        if let Some(handle) =
            buffer.buffer_insert(&channel, segment_id, 1, batch, begin.clone(), end.clone())?
        {
            sync_handles.push(handle);
        }
        if batch_no % SYNC_EVERY == SYNC_EVERY - 1 {
            sync_handles.extend(buffer.sync_channel(&channel)?);
            buffer.set_flush_timestamp(&channel, end_ts)?;
        }

        tick_tx.send(FlowGraphMsg::tick(begin.timestamp, end_ts)).await?;
        last = end;
        tokio::time::sleep(Duration::from_millis(TICK_MS)).await;
    }

    sync_handles.extend(buffer.sync_channel(&channel)?);
    for handle in sync_handles {
        let key = handle.key();
        if let Err(e) = handle.await {
            warn!(%key, error = %e, "sync task failed");
        }
    }

    tick_tx
        .send(FlowGraphMsg::close(last.timestamp, vec![last.clone()]))
        .await?;
    tt_task.await?;
    updater.shutdown().await;
    updater_task.await?;

    let stats = sync_mgr.stats();
    let cp = updater.stats();
    info!(
        submitted = stats.submitted,
        succeeded = stats.succeeded,
        failed = stats.failed,
        published = cp.published,
        publish_failures = cp.failures,
        final_cp_ts = ?updater.get(&channel).map(|p| p.timestamp.as_u64()),
        "demo finished"
    );
    Ok(())
}
