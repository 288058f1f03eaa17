//! Locally buffered document snapshot.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Payload as last written to the local durable buffer.
///
/// Serialized as `{"data": ..., "timestamp": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSnapshot<P> {
    pub data: P,
    /// Write time in epoch milliseconds.
    pub timestamp: i64,
}

impl<P> LocalSnapshot<P> {
    pub fn new(data: P) -> Self {
        Self {
            data,
            timestamp: now_epoch_ms(),
        }
    }
}

/// Current wall-clock time in epoch milliseconds; `0` if the clock is before 1970.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
