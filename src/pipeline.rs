use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::buffer::{build_buffer, AddOutcome, IngestionBuffer};
use crate::config::{AppConfig, PipelineConfig};
use crate::entry::Entry;
use crate::error::Result;
use crate::flush::FlushLoop;
use crate::metrics::SnapshotHub;
use crate::retention::RetentionSweeper;
use crate::store::{build_store, DurableStore};

/// Capture-buffer-flush-aggregate pipeline.
///
/// Cloning is cheap; every clone feeds the same buffer.
#[derive(Clone)]
pub struct Pipeline {
    buffer: Arc<dyn IngestionBuffer>,
    store: Arc<dyn DurableStore>,
    hub: Arc<SnapshotHub>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        buffer: Arc<dyn IngestionBuffer>,
        store: Arc<dyn DurableStore>,
        hub: Arc<SnapshotHub>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            buffer,
            store,
            hub,
            config,
        }
    }

    /// Connects the configured buffer and store. Any failure here is fatal.
    pub async fn build(config: &AppConfig) -> Result<Self> {
        let buffer = build_buffer(&config.buffer).await?;
        let store = build_store(&config.store).await?;
        info!(
            buffer = buffer.kind(),
            store = store.kind(),
            "pipeline backends ready"
        );
        Ok(Self::new(
            buffer,
            store,
            Arc::new(SnapshotHub::new()),
            config.pipeline.clone(),
        ))
    }

    pub fn hub(&self) -> &Arc<SnapshotHub> {
        &self.hub
    }

    pub fn buffer(&self) -> &Arc<dyn IngestionBuffer> {
        &self.buffer
    }

    /// Hands one entry to the buffer. Never fails; overflow and rejection
    /// are counted by the buffer and reported by the flush loop.
    pub async fn capture(&self, entry: Entry) {
        match self.buffer.add(entry).await {
            AddOutcome::Accepted => {}
            AddOutcome::DisplacedOldest => trace!("buffer full, oldest entry displaced"),
            AddOutcome::Rejected => trace!("buffer rejected entry"),
        }
    }

    /// Starts the flush loop and the retention sweeper. Both stop when
    /// `shutdown` is cancelled; the flush loop drains what is left first.
    pub fn spawn(&self, shutdown: CancellationToken) -> PipelineTasks {
        let flush = FlushLoop::new(
            self.buffer.clone(),
            self.store.clone(),
            self.hub.clone(),
            &self.config,
        );
        let sweeper = RetentionSweeper::from_config(self.store.clone(), &self.config);

        PipelineTasks {
            flush: tokio::spawn(flush.run(shutdown.clone())),
            retention: tokio::spawn(sweeper.run(shutdown)),
        }
    }
}

pub struct PipelineTasks {
    flush: JoinHandle<()>,
    retention: JoinHandle<()>,
}

impl PipelineTasks {
    /// Waits for both tasks to finish after shutdown was signalled.
    pub async fn join(self) {
        if let Err(e) = self.flush.await {
            error!(error = %e, "flush task ended abnormally");
        }
        if let Err(e) = self.retention.await {
            error!(error = %e, "retention task ended abnormally");
        }
    }
}
