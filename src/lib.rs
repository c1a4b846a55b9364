//! Request telemetry pipeline.
//!
//! Every HTTP request becomes an [`entry::Entry`] handed to a pluggable
//! ingestion buffer. A single flush loop drains the buffer on a fixed
//! cadence, writes the raw entries to a SQL store, merges per-second
//! aggregates into it, and publishes a live [`metrics::Snapshot`] to
//! subscribers. A retention sweeper trims old raw entries.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub mod aggregate;
pub mod buffer;
pub mod config;
pub mod entry;
pub mod error;
pub mod flush;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod redis_client;
pub mod retention;
pub mod server;
pub mod store;

pub use error::{PipelineError, Result};
pub use pipeline::Pipeline;

/// Shared application state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    /// Entry point for captured requests.
    pub pipeline: Pipeline,

    /// Live snapshot fan-out; the flush loop publishes, SSE clients read.
    pub hub: Arc<metrics::SnapshotHub>,

    /// Cancelled on shutdown; ends open SSE streams so the server can drain.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(pipeline: Pipeline, shutdown: CancellationToken) -> Self {
        let hub = pipeline.hub().clone();
        Self {
            pipeline,
            hub,
            shutdown,
        }
    }
}
