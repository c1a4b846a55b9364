use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{BroadcastSink, Snapshot};

/// Snapshots buffered per subscriber before the slowest one starts missing
/// updates.
const SUBSCRIBER_BACKLOG: usize = 64;

/// Fan-out point between the flush loop and live subscribers.
///
/// Publishing never waits: a subscriber that falls more than
/// `SUBSCRIBER_BACKLOG` snapshots behind skips ahead, and publishing with no
/// subscribers is a no-op apart from updating [`latest`](Self::latest).
pub struct SnapshotHub {
    sender: broadcast::Sender<Snapshot>,
    latest: Mutex<Snapshot>,
}

impl SnapshotHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BACKLOG);
        Self {
            sender,
            latest: Mutex::new(Snapshot::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.sender.subscribe()
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> Snapshot {
        *self.latest.lock()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SnapshotHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastSink for SnapshotHub {
    fn publish(&self, snapshot: Snapshot) {
        *self.latest.lock() = snapshot;
        // Err only means nobody is listening right now.
        let _ = self.sender.send(snapshot);
    }
}
