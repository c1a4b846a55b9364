//! Batch flush loop: the single consumer of the ingestion buffer.
//!
//! Each flush writes the batch to the durable store, merges its buckets into
//! the aggregate table, then acknowledges it to the buffer. A failure at any
//! step abandons the batch instead, so the durable buffer redelivers it;
//! the entry insert skips ids it already has, which keeps redelivery safe.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::AggregationEngine;
use crate::buffer::{consume_stream, Batch, IngestionBuffer};
use crate::config::{FlushStrategyKind, PipelineConfig};
use crate::error::Result;
use crate::metrics::{BroadcastSink, Snapshot};
use crate::store::DurableStore;

/// Longest a streaming read waits before the loop re-checks its timers and
/// the shutdown token.
const MAX_STREAM_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStrategy {
    Polling {
        interval: Duration,
    },
    Streaming {
        flush_interval: Duration,
        aggregate_interval: Duration,
    },
}

impl FlushStrategy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        match config.strategy {
            FlushStrategyKind::Polling => Self::Polling {
                interval: config.flush_interval(),
            },
            FlushStrategyKind::Streaming => Self::Streaming {
                flush_interval: config.flush_interval(),
                aggregate_interval: config.aggregate_interval(),
            },
        }
    }
}

/// Result of one polling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing buffered; a zero snapshot was published.
    Idle,
    /// Batch persisted and its snapshot published.
    Written { entries: usize, buckets: usize },
    /// Read or write failed; the error was logged.
    Failed,
}

struct Persisted {
    inserted: u64,
    buckets: usize,
}

pub struct FlushLoop {
    buffer: Arc<dyn IngestionBuffer>,
    store: Arc<dyn DurableStore>,
    engine: AggregationEngine,
    sink: Arc<dyn BroadcastSink>,
    strategy: FlushStrategy,
    shutdown_timeout: Duration,
    reported_drops: u64,
}

impl FlushLoop {
    pub fn new(
        buffer: Arc<dyn IngestionBuffer>,
        store: Arc<dyn DurableStore>,
        sink: Arc<dyn BroadcastSink>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            engine: AggregationEngine::new(store.clone(), config.bucket_width()),
            buffer,
            store,
            sink,
            strategy: FlushStrategy::from_config(config),
            shutdown_timeout: config.shutdown_timeout(),
            reported_drops: 0,
        }
    }

    pub fn with_strategy(mut self, strategy: FlushStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Runs until `shutdown` is cancelled, then drains and writes whatever is
    /// left, bounded by the configured shutdown timeout.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            buffer = self.buffer.kind(),
            store = self.store.kind(),
            strategy = ?self.strategy,
            "flush loop started"
        );

        let residual = match self.strategy {
            FlushStrategy::Polling { interval } => {
                self.run_polling(interval, &shutdown).await;
                Batch::default()
            }
            FlushStrategy::Streaming {
                flush_interval,
                aggregate_interval,
            } => {
                self.run_streaming(flush_interval, aggregate_interval, &shutdown)
                    .await
            }
        };

        self.final_flush(residual).await;
        info!("flush loop stopped");
    }

    async fn run_polling(&mut self, interval: Duration, shutdown: &CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush_cycle().await;
                }
            }
        }
    }

    /// Drain, persist, publish. An empty drain publishes `{0,0,0}` so
    /// subscribers can tell the pipeline is alive.
    pub async fn flush_cycle(&mut self) -> CycleOutcome {
        self.report_drops();

        let batch = match self.buffer.drain().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "failed to read from ingestion buffer");
                return CycleOutcome::Failed;
            }
        };

        if batch.is_empty() {
            self.sink.publish(Snapshot::default());
            return CycleOutcome::Idle;
        }

        let snapshot = AggregationEngine::snapshot(batch.entries());
        let started = Instant::now();

        match self.persist(&batch).await {
            Ok(persisted) => {
                self.sink.publish(snapshot);
                debug!(
                    count = batch.len(),
                    inserted = persisted.inserted,
                    buckets = persisted.buckets,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "flushed request entries"
                );
                CycleOutcome::Written {
                    entries: batch.len(),
                    buckets: persisted.buckets,
                }
            }
            Err(e) => {
                error!(error = %e, count = batch.len(), "failed to flush request entries");
                self.buffer.abandon(&batch).await;
                CycleOutcome::Failed
            }
        }
    }

    /// Returns whatever was accumulated but not yet written when shutdown
    /// arrived.
    async fn run_streaming(
        &mut self,
        flush_interval: Duration,
        aggregate_interval: Duration,
        shutdown: &CancellationToken,
    ) -> Batch {
        let poll = flush_interval.min(aggregate_interval).min(MAX_STREAM_POLL);
        let deliveries = consume_stream(self.buffer.clone(), poll);
        futures::pin_mut!(deliveries);

        let mut pending = Batch::default();
        let mut rolling = Snapshot::default();
        let mut next_publish = Instant::now() + aggregate_interval;
        let mut next_flush = Instant::now() + flush_interval;

        // Reads are never raced against the token: dropping an in-flight
        // XREADGROUP would strand its entries in the pending list.
        while !shutdown.is_cancelled() {
            let Some(delivery) = deliveries.next().await else {
                break;
            };

            match delivery {
                Ok(batch) => {
                    for entry in batch.entries() {
                        rolling.record(entry.is_success());
                    }
                    pending.extend(batch);
                }
                Err(e) => {
                    warn!(error = %e, "failed to read from ingestion buffer");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }

            let now = Instant::now();
            if now >= next_publish {
                self.sink.publish(std::mem::take(&mut rolling));
                next_publish = now + aggregate_interval;
            }
            if now >= next_flush {
                self.report_drops();
                self.write_pending(std::mem::take(&mut pending)).await;
                next_flush = now + flush_interval;
            }
        }

        pending
    }

    async fn write_pending(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        let started = Instant::now();
        match self.persist(&batch).await {
            Ok(persisted) => debug!(
                count = batch.len(),
                inserted = persisted.inserted,
                buckets = persisted.buckets,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "flushed request entries"
            ),
            Err(e) => {
                error!(error = %e, count = batch.len(), "failed to flush request entries");
                self.buffer.abandon(&batch).await;
            }
        }
    }

    async fn persist(&self, batch: &Batch) -> Result<Persisted> {
        let inserted = if batch.entries().is_empty() {
            0
        } else {
            self.store.insert_entries(batch.entries()).await?
        };
        let buckets = self.engine.apply(batch.entries()).await?;
        self.buffer.acknowledge(batch).await?;
        Ok(Persisted {
            inserted,
            buckets: buckets.len(),
        })
    }

    async fn final_flush(&mut self, residual: Batch) {
        self.report_drops();
        match tokio::time::timeout(self.shutdown_timeout, self.drain_and_write(residual)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(count)) => info!(count, "flushed residual entries on shutdown"),
            Ok(Err(e)) => error!(error = %e, "failed to flush residual entries on shutdown"),
            Err(_) => error!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "final flush timed out"
            ),
        }
    }

    async fn drain_and_write(&self, mut residual: Batch) -> Result<usize> {
        match self.buffer.drain().await {
            Ok(batch) => residual.extend(batch),
            Err(e) => warn!(error = %e, "failed to drain buffer on shutdown"),
        }
        if residual.is_empty() {
            return Ok(0);
        }
        self.persist(&residual).await?;
        Ok(residual.len())
    }

    fn report_drops(&mut self) {
        let total = self.buffer.dropped_entries();
        if total > self.reported_drops {
            warn!(
                dropped = total - self.reported_drops,
                total,
                buffer = self.buffer.kind(),
                "ingestion buffer lost entries"
            );
            self.reported_drops = total;
        }
    }
}
