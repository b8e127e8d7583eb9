pub mod tso;
pub mod chunk_store;
pub mod syncmgr;
pub mod checkpoint;
pub mod writebuffer;
pub mod flowgraph;
pub mod config;
pub mod observability;

pub use checkpoint::{spawn_checkpoint_updater, CheckpointStore, CheckpointUpdaterHandle};
pub use config::DataNodeConfig;
pub use flowgraph::{FlowGraphMsg, Node, TtNode};
pub use syncmgr::{MsgPosition, SyncManager, SyncTask};
pub use tso::Timestamp;
pub use writebuffer::{BufferManager, WriteBufferManager};
