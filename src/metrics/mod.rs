pub mod hub;
pub mod stream;

use serde::{Deserialize, Serialize};

pub use hub::SnapshotHub;

/// Counts published to live subscribers once per flush cycle (polling) or
/// aggregate interval (streaming).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
}

impl Snapshot {
    pub fn new(total_requests: u64, success_requests: u64, failed_requests: u64) -> Self {
        Self {
            total_requests,
            success_requests,
            failed_requests,
        }
    }

    pub fn record(&mut self, success: bool) {
        self.total_requests += 1;
        if success {
            self.success_requests += 1;
        } else {
            self.failed_requests += 1;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_requests == 0
    }
}

/// Receives published snapshots.
///
/// `publish` is called from the flush loop and must not block; delivery
/// failures are the sink's problem.
pub trait BroadcastSink: Send + Sync {
    fn publish(&self, snapshot: Snapshot);
}
