use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::Snapshot;
use crate::AppState;

// ─── GET /api/metrics ────────────────────────────────────────────
/// Returns the most recently published snapshot as JSON.

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Snapshot> {
    Json(state.hub.latest())
}

// ─── GET /api/metrics/stream ─────────────────────────────────────
/// Server-Sent Events endpoint.
/// Forwards every snapshot the flush loop publishes, as a `metrics` event.
/// A subscriber that lags behind skips the missed snapshots. The stream ends
/// when the server starts shutting down.

pub async fn metrics_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.hub.subscribe()).filter_map(|published| {
        let snapshot = published.ok()?;
        let json = serde_json::to_string(&snapshot).unwrap_or_default();
        Some(Ok(Event::default().event("metrics").data(json)))
    });
    let stream = futures::StreamExt::take_until(stream, state.shutdown.clone().cancelled_owned());

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
