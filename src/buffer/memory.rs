use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{AddOutcome, Batch, IngestionBuffer};
use crate::entry::Entry;
use crate::error::Result;

/// Default number of entries held before the oldest is dropped.
pub const DEFAULT_CAPACITY: usize = 50_000;

/// Fixed-capacity in-process buffer.
///
/// Any number of producers may `add` concurrently; one consumer drains. When
/// full, the oldest pending entry is discarded so producers never wait.
pub struct MemoryBuffer {
    queue: Mutex<VecDeque<Entry>>,
    capacity: usize,
    ready: Notify,
    dropped: AtomicU64,
}

impl MemoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity,
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn push(&self, entry: Entry) -> AddOutcome {
        let outcome = {
            let mut queue = self.queue.lock();
            let outcome = if queue.len() >= self.capacity {
                queue.pop_front();
                AddOutcome::DisplacedOldest
            } else {
                AddOutcome::Accepted
            };
            queue.push_back(entry);
            outcome
        };

        if outcome == AddOutcome::DisplacedOldest {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        outcome
    }

    fn take_all(&self) -> Batch {
        let entries: Vec<Entry> = self.queue.lock().drain(..).collect();
        Batch::new(entries)
    }
}

impl Default for MemoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl IngestionBuffer for MemoryBuffer {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn add(&self, entry: Entry) -> AddOutcome {
        self.push(entry)
    }

    async fn drain(&self) -> Result<Batch> {
        Ok(self.take_all())
    }

    async fn wait_batch(&self, timeout: Duration) -> Result<Batch> {
        let batch = self.take_all();
        if !batch.is_empty() {
            return Ok(batch);
        }
        // A permit left by an earlier add can wake us with nothing queued;
        // the caller then just sees an empty batch.
        let _ = tokio::time::timeout(timeout, self.ready.notified()).await;
        Ok(self.take_all())
    }

    async fn acknowledge(&self, _batch: &Batch) -> Result<()> {
        Ok(())
    }

    async fn abandon(&self, batch: &Batch) {
        self.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
        tracing::warn!(
            lost = batch.len(),
            "volatile buffer cannot redeliver an unwritten batch"
        );
    }

    fn dropped_entries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entries(n: usize) -> Vec<Entry> {
        (0..n)
            .map(|i| Entry::capture(i as u64, 200, &format!("/e/{i}")))
            .collect()
    }

    #[tokio::test]
    async fn drain_returns_everything_once_under_capacity() {
        let buffer = MemoryBuffer::new(10);
        let input = entries(7);
        for e in &input {
            assert_eq!(buffer.add(e.clone()).await, AddOutcome::Accepted);
        }

        let batch = buffer.drain().await.unwrap();
        assert_eq!(batch.entries(), input.as_slice());

        let again = buffer.drain().await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let buffer = MemoryBuffer::new(3);
        let [a, b, c, d]: [Entry; 4] = entries(4).try_into().unwrap();

        buffer.add(a).await;
        buffer.add(b.clone()).await;
        buffer.add(c.clone()).await;
        assert_eq!(buffer.add(d.clone()).await, AddOutcome::DisplacedOldest);

        let batch = buffer.drain().await.unwrap();
        assert_eq!(batch.entries(), &[b, c, d]);
        assert_eq!(buffer.dropped_entries(), 1);
    }

    #[tokio::test]
    async fn keeps_only_the_most_recent_capacity_entries() {
        let capacity = 16;
        let extra = 9;
        let buffer = MemoryBuffer::new(capacity);
        let input = entries(capacity + extra);
        for e in &input {
            buffer.add(e.clone()).await;
        }

        let batch = buffer.drain().await.unwrap();
        assert_eq!(batch.entries(), &input[extra..]);
        assert_eq!(buffer.dropped_entries(), extra as u64);
    }

    #[tokio::test]
    async fn concurrent_producers_lose_nothing_under_capacity() {
        let buffer = Arc::new(MemoryBuffer::new(10_000));
        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let buffer = buffer.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..500u64 {
                    buffer
                        .add(Entry::capture(worker * 1_000 + i, 200, "/c"))
                        .await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let batch = buffer.drain().await.unwrap();
        assert_eq!(batch.len(), 4_000);

        let mut ids: Vec<_> = batch.entries().iter().map(|e| e.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4_000);

        // FIFO per writer: each worker's durations appear in increasing order.
        for worker in 0..8u64 {
            let seen: Vec<u64> = batch
                .entries()
                .iter()
                .map(|e| e.duration_ms())
                .filter(|d| d / 1_000 == worker)
                .collect();
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[tokio::test]
    async fn abandoned_batches_count_as_dropped() {
        let buffer = MemoryBuffer::new(4);
        buffer.add(Entry::capture(1, 200, "/a")).await;
        buffer.add(Entry::capture(2, 500, "/b")).await;

        let batch = buffer.drain().await.unwrap();
        buffer.abandon(&batch).await;

        assert_eq!(buffer.dropped_entries(), 2);
        assert!(buffer.drain().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wait_batch_wakes_when_an_entry_arrives() {
        let buffer = Arc::new(MemoryBuffer::new(4));
        let producer = buffer.clone();
        let entry = Entry::capture(1, 404, "/late");
        let expected = entry.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.add(entry).await;
        });

        let batch = buffer.wait_batch(Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.entries(), &[expected]);
    }

    #[tokio::test]
    async fn wait_batch_times_out_empty() {
        let buffer = MemoryBuffer::new(4);
        let batch = buffer.wait_batch(Duration::from_millis(10)).await.unwrap();
        assert!(batch.is_empty());
    }
}
