use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nucleus_telemetry::config::AppConfig;
use nucleus_telemetry::{server, AppState, Pipeline};

#[derive(Debug, Parser)]
#[command(name = "nucleus", version, about = "Request telemetry pipeline")]
struct Cli {
    /// Path to a TOML config file. Environment variables prefixed with
    /// `NUCLEUS_` override it.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // ── 1. Configuration ─────────────────────────────────────────
    let config = AppConfig::load(cli.config.as_deref())?;
    config.validate().context("Invalid configuration")?;

    // ── 2. Backends ──────────────────────────────────────────────
    let pipeline = Pipeline::build(&config)
        .await
        .context("Failed to initialise pipeline backends")?;

    // ── 3. Background tasks ──────────────────────────────────────
    let shutdown = CancellationToken::new();
    let tasks = pipeline.spawn(shutdown.clone());

    // ── 4. Build Axum router ─────────────────────────────────────
    // Separate token so in-flight requests are still captured while the
    // server drains; the pipeline stops only after serving ends.
    let stop_streams = CancellationToken::new();
    let app = server::create_router(Arc::new(AppState::new(pipeline, stop_streams.clone())));

    // ── 5. Bind & serve ──────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!(%addr, "listening");
    info!("metrics JSON -> /api/metrics, SSE -> /api/metrics/stream, demo -> /api/simulate");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            stop_streams.cancel();
        })
        .await
        .context("Server exited with error")?;

    // ── 6. Drain ─────────────────────────────────────────────────
    shutdown.cancel();
    tasks.join().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
