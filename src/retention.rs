use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::store::DurableStore;

/// Periodically deletes raw entries older than the TTL. Aggregate buckets are
/// never touched.
pub struct RetentionSweeper {
    store: Arc<dyn DurableStore>,
    ttl: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn DurableStore>, ttl: Duration, interval: Duration) -> Self {
        Self {
            store,
            ttl,
            interval,
        }
    }

    pub fn from_config(store: Arc<dyn DurableStore>, config: &PipelineConfig) -> Self {
        Self::new(store, config.log_ttl(), config.retention_interval())
    }

    /// Deletes entries with `timestamp < now - ttl`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let threshold = DateTime::from_timestamp_millis(now.timestamp_millis().saturating_sub(ttl_ms))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.store.delete_expired(threshold).await
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            ttl_secs = self.ttl.as_secs(),
            interval_ms = self.interval.as_millis() as u64,
            "retention sweeper started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep_at(Utc::now()).await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "expired request entries deleted"),
                        Err(e) => warn!(error = %e, "retention sweep failed"),
                    }
                }
            }
        }

        info!("retention sweeper stopped");
    }
}
