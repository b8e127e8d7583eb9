//! Time tick stage
//!
//! Side-effecting tap at the end of a channel's flow graph. On each time tick
//! it asks the write buffer for the channel's safe checkpoint and, when due,
//! hands it to the checkpoint updater without waiting for publication.
//!
//! An update is due when the write buffer asks for one or when
//! `update_interval` has passed since the last *published* update. The last
//! update time only moves inside the publish callback, so a slow or failing
//! publish delays the next interval-driven trigger.

use crate::checkpoint::CheckpointUpdaterHandle;
use crate::config::TtNodeConfig;
use crate::flowgraph::{FlowGraphMsg, Node};
use crate::syncmgr::MsgPosition;
use crate::writebuffer::WriteBufferManager;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TtNode<W: WriteBufferManager> {
    channel: String,
    write_buffer: Arc<W>,
    updater: CheckpointUpdaterHandle,
    update_interval_ms: u64,
    /// Wall-clock ms of the last published trigger; `None` until the first one
    last_update_time: Arc<Mutex<Option<u64>>>,
}

impl<W: WriteBufferManager> TtNode<W> {
    pub fn new(
        channel: impl Into<String>,
        write_buffer: Arc<W>,
        updater: CheckpointUpdaterHandle,
        config: &TtNodeConfig,
    ) -> Self {
        TtNode {
            channel: channel.into(),
            write_buffer,
            updater,
            update_interval_ms: config.update_interval.as_millis() as u64,
            last_update_time: Arc::new(Mutex::new(None)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn last_update_time(&self) -> Option<u64> {
        *self.last_update_time.lock()
    }

    fn interval_elapsed(&self, cur_ms: u64) -> bool {
        match *self.last_update_time.lock() {
            None => true,
            Some(last) => cur_ms.saturating_sub(last) >= self.update_interval_ms,
        }
    }

    fn update_channel_cp(&self, position: MsgPosition, cur_ms: u64) {
        let last_update_time = self.last_update_time.clone();
        let write_buffer = self.write_buffer.clone();
        let channel = self.channel.clone();
        let cp_ts = position.timestamp;

        self.updater.update(&self.channel, position, move || {
            *last_update_time.lock() = Some(cur_ms);
            write_buffer.notify_checkpoint_updated(&channel, cp_ts);
            debug!(
                %channel,
                cp_ts = cp_ts.as_u64(),
                cp_time_ms = cp_ts.physical_millis(),
                "channel checkpoint updated"
            );
        });
    }
}

impl<W: WriteBufferManager> Node for TtNode<W> {
    fn name(&self) -> String {
        format!("ttNode-{}", self.channel)
    }

    fn operate(&mut self, input: Vec<FlowGraphMsg>) -> Vec<FlowGraphMsg> {
        let Some(msg) = input.first() else {
            return Vec::new();
        };
        let cur_ms = msg.time_range.timestamp_max.physical_millis();

        if msg.is_close_msg() {
            if !msg.end_positions.is_empty() {
                match self.write_buffer.get_checkpoint(&self.channel) {
                    Ok((position, _)) => {
                        info!(
                            channel = %self.channel,
                            cp_time_ms = position.timestamp.physical_millis(),
                            "flow graph closing, force update channel checkpoint"
                        );
                        self.update_channel_cp(position, cur_ms);
                    }
                    Err(e) => {
                        warn!(channel = %self.channel, error = %e, "channel removed");
                        return Vec::new();
                    }
                }
            }
            return input;
        }

        let (position, needs_update) = match self.write_buffer.get_checkpoint(&self.channel) {
            Ok(cp) => cp,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "channel removed");
                return Vec::new();
            }
        };

        if needs_update || self.interval_elapsed(cur_ms) {
            self.update_channel_cp(position, cur_ms);
        }
        Vec::new()
    }
}
