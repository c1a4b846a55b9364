use thiserror::Error;

/// Errors produced by the telemetry pipeline.
///
/// Construction-time errors (`Unsupported`, and `Redis`/`Database` raised while
/// building a backend) are fatal. Everything raised inside a
/// flush or sweep cycle is logged by the loop that owns the cycle and never
/// leaves it.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported {kind} backend '{name}'")]
    Unsupported { kind: &'static str, name: String },

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("malformed stream record: {0}")]
    MalformedRecord(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
