use std::panic::AssertUnwindSafe;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use futures::FutureExt;
use tracing::debug;

use crate::entry::Entry;
use crate::pipeline::Pipeline;

/// Records one [`Entry`] per request and adds two response headers:
///
///   X-Response-Time-Us: handler wall time in microseconds
///   Server-Timing: same value in the standard Server-Timing format
///
/// A panicking handler is still recorded, as a 500, before the panic
/// continues up the stack.
pub async fn capture_middleware(
    State(pipeline): State<Pipeline>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let start = Instant::now();
    let outcome = AssertUnwindSafe(next.run(req)).catch_unwind().await;
    let elapsed = start.elapsed();
    let duration_ms = elapsed.as_millis() as u64;

    let mut response = match outcome {
        Ok(response) => response,
        Err(panic) => {
            pipeline
                .capture(Entry::capture(
                    duration_ms,
                    StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    &path,
                ))
                .await;
            std::panic::resume_unwind(panic);
        }
    };

    let status = response.status().as_u16();
    pipeline
        .capture(Entry::capture(duration_ms, status, &path))
        .await;

    let us = elapsed.as_micros();
    if let Ok(val) = HeaderValue::from_str(&us.to_string()) {
        response.headers_mut().insert("X-Response-Time-Us", val);
    }
    let server_timing = format!("total;dur={:.3}", elapsed.as_secs_f64() * 1000.0);
    if let Ok(val) = HeaderValue::from_str(&server_timing) {
        response.headers_mut().insert("Server-Timing", val);
    }

    debug!(%method, path = %path, status, elapsed_us = us as u64, "request captured");
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{IngestionBuffer, MemoryBuffer};
    use crate::config::PipelineConfig;
    use crate::flush::tests::RecordingStore;
    use crate::metrics::SnapshotHub;
    use axum::{middleware, routing::get, Router};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn serve(buffer: Arc<MemoryBuffer>) -> std::net::SocketAddr {
        let pipeline = Pipeline::new(
            buffer,
            Arc::new(RecordingStore::default()),
            Arc::new(SnapshotHub::new()),
            PipelineConfig::default(),
        );
        let app = Router::new()
            .route("/ok", get(|| async { "fine" }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/boom",
                get(|| async {
                    if true {
                        panic!("handler exploded");
                    }
                    "unreachable"
                }),
            )
            .layer(middleware::from_fn_with_state(pipeline, capture_middleware));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Sends a bare HTTP/1.1 GET and returns the raw response text, empty if
    /// the server dropped the connection.
    async fn get_raw(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        let _ = stream.read_to_end(&mut raw).await;
        String::from_utf8_lossy(&raw).into_owned()
    }

    #[tokio::test]
    async fn records_status_and_path_and_sets_timing_headers() {
        let buffer = Arc::new(MemoryBuffer::new(16));
        let addr = serve(buffer.clone()).await;

        let ok = get_raw(addr, "/ok").await;
        assert!(ok.starts_with("HTTP/1.1 200"));
        let lower = ok.to_ascii_lowercase();
        assert!(lower.contains("x-response-time-us:"));
        assert!(lower.contains("server-timing: total;dur="));

        let missing = get_raw(addr, "/missing").await;
        assert!(missing.starts_with("HTTP/1.1 404"));

        let batch = buffer.drain().await.unwrap();
        let seen: Vec<(u16, &str)> = batch
            .entries()
            .iter()
            .map(|e| (e.status_code(), e.path()))
            .collect();
        assert_eq!(seen, vec![(200, "/ok"), (404, "/missing")]);
    }

    #[tokio::test]
    async fn panicking_handler_is_recorded_as_500() {
        let buffer = Arc::new(MemoryBuffer::new(16));
        let addr = serve(buffer.clone()).await;

        let response = get_raw(addr, "/boom").await;
        assert!(!response.starts_with("HTTP/1.1 200"));

        let batch = buffer.drain().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.entries()[0].status_code(), 500);
        assert_eq!(batch.entries()[0].path(), "/boom");
    }
}
