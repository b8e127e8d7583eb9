//! Flow graph stages
//!
//! A stage consumes batch-boundary messages from its upstream and produces
//! zero or more messages for its downstream. `NodeRunner` drives one stage
//! from a bounded channel.

pub mod tt_node;

pub use tt_node::TtNode;

use crate::syncmgr::MsgPosition;
use crate::tso::Timestamp;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Timestamp range covered by a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub timestamp_min: Timestamp,
    pub timestamp_max: Timestamp,
}

/// Message passed between flow graph stages at each batch boundary
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlowGraphMsg {
    pub time_range: TimeRange,
    pub start_positions: Vec<MsgPosition>,
    pub end_positions: Vec<MsgPosition>,
    /// Last message before the graph shuts down
    pub is_close: bool,
}

impl FlowGraphMsg {
    /// Regular time tick for a processed batch
    pub fn tick(timestamp_min: Timestamp, timestamp_max: Timestamp) -> Self {
        FlowGraphMsg {
            time_range: TimeRange {
                timestamp_min,
                timestamp_max,
            },
            ..FlowGraphMsg::default()
        }
    }

    /// Shutdown message carrying the positions consumption stopped at
    pub fn close(timestamp_max: Timestamp, end_positions: Vec<MsgPosition>) -> Self {
        FlowGraphMsg {
            time_range: TimeRange {
                timestamp_min: timestamp_max,
                timestamp_max,
            },
            end_positions,
            is_close: true,
            ..FlowGraphMsg::default()
        }
    }

    pub fn is_close_msg(&self) -> bool {
        self.is_close
    }
}

/// A flow graph stage
pub trait Node: Send + 'static {
    fn name(&self) -> String;

    fn is_valid_input(&self, input: &[FlowGraphMsg]) -> bool {
        !input.is_empty()
    }

    /// Process one batch. Returning no messages stops propagation downstream.
    fn operate(&mut self, input: Vec<FlowGraphMsg>) -> Vec<FlowGraphMsg>;

    fn close(&mut self) {}
}

/// Drives a node until its input closes or a close message passes through
pub struct NodeRunner<N: Node> {
    node: N,
    input: mpsc::Receiver<FlowGraphMsg>,
    output: Option<mpsc::Sender<FlowGraphMsg>>,
}

impl<N: Node> NodeRunner<N> {
    pub fn new(
        node: N,
        input: mpsc::Receiver<FlowGraphMsg>,
        output: Option<mpsc::Sender<FlowGraphMsg>>,
    ) -> Self {
        NodeRunner {
            node,
            input,
            output,
        }
    }

    pub async fn run(mut self) {
        let name = self.node.name();
        info!(node = %name, "flow graph node started");

        while let Some(msg) = self.input.recv().await {
            let is_close = msg.is_close_msg();
            let batch = vec![msg];
            if !self.node.is_valid_input(&batch) {
                warn!(node = %name, "invalid input, dropped");
                continue;
            }

            let out = self.node.operate(batch);
            if let Some(tx) = &self.output {
                for m in out {
                    if tx.send(m).await.is_err() {
                        debug!(node = %name, "downstream closed");
                        break;
                    }
                }
            }
            if is_close {
                break;
            }
        }

        self.node.close();
        info!(node = %name, "flow graph node stopped");
    }
}

/// Spawn a runner for `node`
pub fn spawn_node<N: Node>(
    node: N,
    input: mpsc::Receiver<FlowGraphMsg>,
    output: Option<mpsc::Sender<FlowGraphMsg>>,
) -> JoinHandle<()> {
    tokio::spawn(NodeRunner::new(node, input, output).run())
}
