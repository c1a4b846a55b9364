use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entry::Entry;
use crate::error::Result;
use crate::metrics::Snapshot;
use crate::store::DurableStore;

/// Request counts for one fixed-width time window.
///
/// `total_requests == success_requests + failed_requests` always holds: the
/// counters only change through [`record`](Self::record) and
/// [`merge`](Self::merge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregateBucket {
    bucket_start_ms: i64,
    total_requests: u64,
    success_requests: u64,
    failed_requests: u64,
}

impl AggregateBucket {
    pub fn empty(bucket_start_ms: i64) -> Self {
        Self {
            bucket_start_ms,
            total_requests: 0,
            success_requests: 0,
            failed_requests: 0,
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

    /// Adds another bucket's counts. Order of merges never changes the result.
    pub fn merge(&mut self, other: &AggregateBucket) {
        debug_assert_eq!(self.bucket_start_ms, other.bucket_start_ms);
        self.total_requests += other.total_requests;
        self.success_requests += other.success_requests;
        self.failed_requests += other.failed_requests;
    }

    pub fn bucket_start_ms(&self) -> i64 {
        self.bucket_start_ms
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn success_requests(&self) -> u64 {
        self.success_requests
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests
    }
}

/// Floors `ts` to the start of its bucket, in epoch milliseconds. Timestamps
/// before the epoch floor downward as well.
pub fn bucket_start_ms(ts: DateTime<Utc>, width_ms: i64) -> i64 {
    ts.timestamp_millis().div_euclid(width_ms) * width_ms
}

/// Rolls a batch into buckets, ordered by bucket start.
pub fn bucketize(entries: &[Entry], width: Duration) -> Vec<AggregateBucket> {
    let width_ms = i64::try_from(width.as_millis()).unwrap_or(i64::MAX).max(1);
    let mut buckets: BTreeMap<i64, AggregateBucket> = BTreeMap::new();

    for entry in entries {
        let start = bucket_start_ms(entry.timestamp(), width_ms);
        buckets
            .entry(start)
            .or_insert_with(|| AggregateBucket::empty(start))
            .record(entry.is_success());
    }

    buckets.into_values().collect()
}

/// Buckets each flushed batch and merges the result into the durable
/// aggregate table.
#[derive(Clone)]
pub struct AggregationEngine {
    store: Arc<dyn DurableStore>,
    width: Duration,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn DurableStore>, width: Duration) -> Self {
        Self { store, width }
    }

    /// Merges the batch's buckets in one upsert and returns them.
    pub async fn apply(&self, entries: &[Entry]) -> Result<Vec<AggregateBucket>> {
        let buckets = bucketize(entries, self.width);
        if !buckets.is_empty() {
            self.store.merge_buckets(&buckets).await?;
        }
        Ok(buckets)
    }

    /// Live per-cycle counts for subscribers. Not persisted.
    pub fn snapshot(entries: &[Entry]) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for entry in entries {
            snapshot.record(entry.is_success());
        }
        snapshot
    }
}
