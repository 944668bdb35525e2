//! Wall clock and watermark tracking.
//!
//! Operation timestamps come from each sender's wall clock. There is no
//! skew compensation between machines, so last-write-wins decisions across
//! clients with skewed clocks can pick the "wrong" writer.

use serde::{Deserialize, Serialize};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Highest operation timestamp a session has processed.
///
/// Operations strictly older than the watermark are redeliveries and are
/// skipped. Equal timestamps pass, since concurrent writers can share a
/// millisecond.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark(i64);

impl Watermark {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn starting_at(timestamp: i64) -> Self {
        Self(timestamp)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// True when `timestamp` is older than anything already processed.
    pub fn is_stale(&self, timestamp: i64) -> bool {
        timestamp < self.0
    }

    /// Advance to `max(self, timestamp)`.
    pub fn observe(&mut self, timestamp: i64) {
        self.0 = self.0.max(timestamp);
    }
}
