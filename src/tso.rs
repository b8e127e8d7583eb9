//! Hybrid Timestamps
//!
//! Checkpoint and message timestamps are hybrid logical timestamps: the high
//! bits carry physical milliseconds since the Unix epoch and the low
//! `LOGICAL_BITS` carry a logical counter that orders events within the same
//! millisecond.
//!
//! ```text
//! 63                              18 17              0
//! ┌─────────────────────────────────┬────────────────┐
//! │     physical (ms since epoch)   │    logical     │
//! └─────────────────────────────────┴────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of low bits reserved for the logical counter
pub const LOGICAL_BITS: u32 = 18;

const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Hybrid logical timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Build a timestamp from physical milliseconds and a logical counter.
    /// The logical part is truncated to `LOGICAL_BITS`.
    pub fn compose(physical_ms: u64, logical: u64) -> Self {
        Timestamp((physical_ms << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    /// Timestamp for a wall-clock instant with logical counter zero
    pub fn from_system_time(time: SystemTime) -> Self {
        let ms = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::compose(ms, 0)
    }

    /// Current wall-clock time as a hybrid timestamp
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Physical milliseconds since the Unix epoch
    pub fn physical_millis(&self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn logical(&self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    /// Physical component as a `SystemTime`
    pub fn physical_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.physical_millis())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Wall-clock distance between two timestamps, ignoring logical parts
    pub fn physical_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.physical_millis().saturating_sub(earlier.physical_millis()))
    }
}

impl From<u64> for Timestamp {
    fn from(raw: u64) -> Self {
        Timestamp(raw)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}.{})", self.0, self.physical_millis(), self.logical())
    }
}
