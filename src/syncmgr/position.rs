//! Channel positions
//!
//! A `MsgPosition` marks a point in a channel's message stream. Positions are
//! ordered by timestamp alone; the message id is an opaque blob from the
//! message queue and never takes part in comparisons.

use crate::tso::Timestamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Durability marker scoped to one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgPosition {
    pub channel_name: String,
    /// Opaque message-queue position
    pub msg_id: Vec<u8>,
    /// Consumer group that produced this position
    pub msg_group: String,
    pub timestamp: Timestamp,
}

impl MsgPosition {
    pub fn new(channel_name: impl Into<String>, timestamp: Timestamp) -> Self {
        MsgPosition {
            channel_name: channel_name.into(),
            msg_id: Vec::new(),
            msg_group: String::new(),
            timestamp,
        }
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<Vec<u8>>) -> Self {
        self.msg_id = msg_id.into();
        self
    }

    pub fn with_msg_group(mut self, msg_group: impl Into<String>) -> Self {
        self.msg_group = msg_group.into();
        self
    }

    /// Compare by timestamp only
    pub fn cmp_ts(&self, other: &MsgPosition) -> Ordering {
        self.timestamp.cmp(&other.timestamp)
    }

    /// Strictly newer than `other`; equal timestamps count as the same position
    pub fn is_newer_than(&self, other: &MsgPosition) -> bool {
        self.timestamp > other.timestamp
    }

    /// Same position under timestamp-only comparison
    pub fn same_position(&self, other: &MsgPosition) -> bool {
        self.timestamp == other.timestamp
    }
}

/// Returns the earlier of two optional positions; `None` never wins over `Some`.
pub fn earliest(a: Option<MsgPosition>, b: Option<MsgPosition>) -> Option<MsgPosition> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.timestamp < a.timestamp { b } else { a }),
        (a, None) => a,
        (None, b) => b,
    }
}
