//! Ingestion buffers.
//!
//! Producers (one per in-flight request) call [`IngestionBuffer::add`]; the
//! flush loop is the only reader. Two backends share the trait:
//!
//! * [`MemoryBuffer`]: fixed-capacity in-process queue, drop-oldest on
//!   overflow, lost on restart.
//! * [`RedisLogBuffer`]: Redis stream read through a consumer group,
//!   at-least-once, survives restarts.
//!
//! Which one runs is decided once at startup by [`build_buffer`].

pub mod memory;
pub mod redis_log;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::config::{BufferConfig, BufferKind};
use crate::entry::Entry;
use crate::error::Result;

pub use memory::MemoryBuffer;
pub use redis_log::RedisLogBuffer;

/// What happened to an entry handed to [`IngestionBuffer::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored without displacing anything.
    Accepted,
    /// Stored, but the buffer was full and the oldest pending entry was
    /// discarded to make room.
    DisplacedOldest,
    /// Not stored. Only the durable backend rejects, when its write fails or
    /// exceeds the configured wait.
    Rejected,
}

/// A group of entries handed to the flush loop in one delivery.
///
/// `receipts` carries backend-specific delivery tokens (Redis stream ids)
/// needed to acknowledge the batch. The volatile backend leaves it empty.
#[derive(Debug, Default)]
pub struct Batch {
    entries: Vec<Entry>,
    receipts: Vec<String>,
}

impl Batch {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            receipts: Vec::new(),
        }
    }

    pub(crate) fn with_receipts(entries: Vec<Entry>, receipts: Vec<String>) -> Self {
        Self { entries, receipts }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn receipts(&self) -> &[String] {
        &self.receipts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.receipts.is_empty()
    }

    /// Appends another delivery, keeping its receipts so both can be
    /// acknowledged together.
    pub fn extend(&mut self, other: Batch) {
        self.entries.extend(other.entries);
        self.receipts.extend(other.receipts);
    }
}

/// Capability shared by every buffer backend.
#[async_trait]
pub trait IngestionBuffer: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Offers an entry. Must return promptly even when the buffer is
    /// saturated; backends degrade (drop or reject) rather than block.
    async fn add(&self, entry: Entry) -> AddOutcome;

    /// Removes and returns everything currently deliverable, without waiting.
    async fn drain(&self) -> Result<Batch>;

    /// Like [`drain`](Self::drain) but waits up to `timeout` for the first
    /// entry to arrive. Returns an empty batch on timeout.
    async fn wait_batch(&self, timeout: Duration) -> Result<Batch>;

    /// Commits a delivered batch after it has been written.
    async fn acknowledge(&self, batch: &Batch) -> Result<()>;

    /// Gives up on a delivered batch that could not be written. Durable
    /// backends arrange redelivery; the volatile backend loses it.
    async fn abandon(&self, batch: &Batch);

    /// Entries lost since startup: displaced by the overflow policy, rejected
    /// by the backend at `add` time, or abandoned without a way to redeliver
    /// them.
    fn dropped_entries(&self) -> u64 {
        0
    }
}

/// Lazily reads `buffer` as an endless stream of deliveries.
///
/// Each item is one [`IngestionBuffer::wait_batch`] call; an empty batch means
/// `poll` elapsed with nothing to read and lets the consumer check its timers.
pub fn consume_stream(
    buffer: Arc<dyn IngestionBuffer>,
    poll: Duration,
) -> impl Stream<Item = Result<Batch>> + Send {
    futures::stream::unfold(buffer, move |buffer| async move {
        let next = buffer.wait_batch(poll).await;
        Some((next, buffer))
    })
}

/// Builds the configured backend. Redis setup failures other than an
/// already-existing consumer group are returned to the caller.
pub async fn build_buffer(config: &BufferConfig) -> Result<Arc<dyn IngestionBuffer>> {
    match config.kind {
        BufferKind::Memory => Ok(Arc::new(MemoryBuffer::new(config.capacity))),
        BufferKind::Redis => {
            let buffer = RedisLogBuffer::connect(&config.redis).await?;
            Ok(Arc::new(buffer))
        }
    }
}
