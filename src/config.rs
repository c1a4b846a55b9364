use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::buffer::memory::DEFAULT_CAPACITY;
use crate::error::PipelineError;

/// Shortest interval any loop will tick at. `tokio::time::interval` panics on
/// a zero period, and a configured `0` means "as often as possible".
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Longest interval or timeout accepted, in seconds (one year). Deadlines are
/// computed as `now + interval`, which must not overflow.
pub const MAX_INTERVAL_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// Widest bucket accepted; bucket starts are signed epoch milliseconds.
pub const MAX_BUCKET_WIDTH_MS: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

/// Flush loop scheduling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushStrategyKind {
    /// Wake every flush interval and drain.
    #[default]
    Polling,
    /// Read continuously; publish and persist on separate boundaries.
    Streaming,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_one_second")]
    pub flush_interval_seconds: f64,
    #[serde(default = "default_log_ttl")]
    pub log_ttl_seconds: u64,
    #[serde(default = "default_one_second")]
    pub retention_interval_seconds: f64,
    #[serde(default = "default_bucket_width_ms")]
    pub bucket_width_ms: u64,
    #[serde(default)]
    pub strategy: FlushStrategyKind,
    /// Publish cadence of the streaming strategy. Polling publishes once per
    /// flush instead.
    #[serde(default = "default_one_second")]
    pub aggregate_interval_seconds: f64,
    /// Upper bound on the final drain-and-write at shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval_seconds: default_one_second(),
            log_ttl_seconds: default_log_ttl(),
            retention_interval_seconds: default_one_second(),
            bucket_width_ms: default_bucket_width_ms(),
            strategy: FlushStrategyKind::default(),
            aggregate_interval_seconds: default_one_second(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        interval_from_secs(self.flush_interval_seconds)
    }

    pub fn aggregate_interval(&self) -> Duration {
        interval_from_secs(self.aggregate_interval_seconds)
    }

    pub fn retention_interval(&self) -> Duration {
        interval_from_secs(self.retention_interval_seconds)
    }

    pub fn log_ttl(&self) -> Duration {
        Duration::from_secs(self.log_ttl_seconds)
    }

    pub fn bucket_width(&self) -> Duration {
        Duration::from_millis(self.bucket_width_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.shutdown_timeout_seconds)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_shutdown_timeout()))
    }
}

fn default_one_second() -> f64 {
    1.0
}

fn default_log_ttl() -> u64 {
    60
}

fn default_bucket_width_ms() -> u64 {
    1_000
}

fn default_shutdown_timeout() -> f64 {
    5.0
}

/// Negative or non-finite values fall back to the floor; `validate` rejects
/// them before they get this far.
fn interval_from_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MIN_INTERVAL)
        .max(MIN_INTERVAL)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum BufferKind {
    #[default]
    Memory,
    Redis,
}

impl TryFrom<String> for BufferKind {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            _ => Err(PipelineError::Unsupported {
                kind: "buffer",
                name: value,
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default)]
    pub kind: BufferKind,
    /// Volatile backend only.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            kind: BufferKind::default(),
            capacity: default_capacity(),
            redis: RedisConfig::default(),
        }
    }
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_stream_key")]
    pub stream_key: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_consumer")]
    pub consumer: String,
    /// Maximum entries per `XREADGROUP`.
    #[serde(default = "default_read_count")]
    pub read_count: usize,
    /// How long a producer may wait on `XADD` before its entry is rejected.
    #[serde(default = "default_add_timeout_ms")]
    pub add_timeout_ms: u64,
    /// Approximate `MAXLEN` trim applied on every append. Unset keeps the
    /// stream unbounded.
    #[serde(default)]
    pub max_len: Option<usize>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            stream_key: default_stream_key(),
            group: default_group(),
            consumer: default_consumer(),
            read_count: default_read_count(),
            add_timeout_ms: default_add_timeout_ms(),
            max_len: None,
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_stream_key() -> String {
    "nucleus:logs".to_string()
}

fn default_group() -> String {
    "nucleus".to_string()
}

fn default_consumer() -> String {
    "consumer-1".to_string()
}

fn default_read_count() -> usize {
    10_000
}

fn default_add_timeout_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum StoreKind {
    #[default]
    Sqlite,
    Postgres,
}

impl TryFrom<String> for StoreKind {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => Err(PipelineError::Unsupported {
                kind: "store",
                name: value,
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_metrics_table")]
    pub metrics_table: String,
    #[serde(default = "default_aggregates_table")]
    pub aggregates_table: String,
    /// Create tables and indexes at startup if they are missing.
    #[serde(default = "default_true")]
    pub ensure_schema: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            url: default_store_url(),
            metrics_table: default_metrics_table(),
            aggregates_table: default_aggregates_table(),
            ensure_schema: true,
            max_connections: default_max_connections(),
        }
    }
}

fn default_store_url() -> String {
    "sqlite://nucleus.db?mode=rwc".to_string()
}

fn default_metrics_table() -> String {
    "request_metrics".to_string()
}

fn default_aggregates_table() -> String {
    "request_aggregates".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    5
}

impl AppConfig {
    /// Loads configuration from an optional file layered with `NUCLEUS_`
    /// environment variables, e.g. `NUCLEUS_BUFFER__KIND=redis`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("NUCLEUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        for (name, value) in [
            ("flush_interval_seconds", p.flush_interval_seconds),
            ("retention_interval_seconds", p.retention_interval_seconds),
            ("aggregate_interval_seconds", p.aggregate_interval_seconds),
            ("shutdown_timeout_seconds", p.shutdown_timeout_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("pipeline.{name} must be a non-negative number, got {value}");
            }
            if value > MAX_INTERVAL_SECS {
                bail!("pipeline.{name} must be at most {MAX_INTERVAL_SECS} seconds, got {value}");
            }
        }
        if p.bucket_width_ms == 0 || p.bucket_width_ms > MAX_BUCKET_WIDTH_MS {
            bail!(
                "pipeline.bucket_width_ms must be between 1 and {MAX_BUCKET_WIDTH_MS}, got {}",
                p.bucket_width_ms
            );
        }

        if self.buffer.kind == BufferKind::Memory && self.buffer.capacity == 0 {
            bail!("buffer.capacity must be greater than zero");
        }

        for (name, table) in [
            ("metrics_table", &self.store.metrics_table),
            ("aggregates_table", &self.store.aggregates_table),
        ] {
            if !is_identifier(table) {
                bail!("store.{name} '{table}' is not a plain SQL identifier");
            }
        }
        if self.store.metrics_table == self.store.aggregates_table {
            bail!("store.metrics_table and store.aggregates_table must differ");
        }

        Ok(())
    }
}

/// Table names are interpolated into SQL, so only `[A-Za-z_][A-Za-z0-9_]*`
/// is accepted.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> Result<AppConfig> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pipeline.flush_interval(), Duration::from_secs(1));
        assert_eq!(config.pipeline.bucket_width(), Duration::from_secs(1));
        assert_eq!(config.buffer.kind, BufferKind::Memory);
        assert_eq!(config.store.kind, StoreKind::Sqlite);
    }

    #[test]
    fn parses_a_full_file() {
        let config = from_toml(
            r#"
            [pipeline]
            flush_interval_seconds = 0.5
            log_ttl_seconds = 120
            strategy = "streaming"

            [buffer]
            kind = "redis"

            [buffer.redis]
            url = "redis://cache:6379/"
            max_len = 100000

            [store]
            kind = "postgres"
            url = "postgres://nucleus@db/nucleus"
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.pipeline.flush_interval(), Duration::from_millis(500));
        assert_eq!(config.pipeline.log_ttl(), Duration::from_secs(120));
        assert_eq!(config.pipeline.strategy, FlushStrategyKind::Streaming);
        assert_eq!(config.buffer.kind, BufferKind::Redis);
        assert_eq!(config.buffer.redis.max_len, Some(100_000));
        assert_eq!(config.buffer.redis.stream_key, "nucleus:logs");
        assert_eq!(config.store.kind, StoreKind::Postgres);
    }

    #[test]
    fn unknown_backend_kind_is_fatal() {
        let err = from_toml("[store]\nkind = \"sqlserver\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("unsupported store backend 'sqlserver'"));

        let err = from_toml("[buffer]\nkind = \"kafka\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("unsupported buffer backend 'kafka'"));
    }

    #[test]
    fn zero_flush_interval_is_clamped() {
        let mut config = AppConfig::default();
        config.pipeline.flush_interval_seconds = 0.0;
        config.validate().unwrap();
        assert_eq!(config.pipeline.flush_interval(), MIN_INTERVAL);
    }

    #[test]
    fn rejects_negative_and_nan_intervals() {
        let mut config = AppConfig::default();
        config.pipeline.flush_interval_seconds = -1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.retention_interval_seconds = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_intervals_too_large_to_schedule() {
        let mut config = AppConfig::default();
        config.pipeline.flush_interval_seconds = 1e20;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.shutdown_timeout_seconds = MAX_INTERVAL_SECS + 1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.aggregate_interval_seconds = MAX_INTERVAL_SECS;
        config.validate().unwrap();
        assert_eq!(
            config.pipeline.aggregate_interval(),
            Duration::from_secs_f64(MAX_INTERVAL_SECS)
        );
    }

    #[test]
    fn rejects_bucket_width_beyond_signed_millis() {
        let mut config = AppConfig::default();
        config.pipeline.bucket_width_ms = u64::MAX;
        assert!(config.validate().is_err());

        config.pipeline.bucket_width_ms = MAX_BUCKET_WIDTH_MS;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_capacity_and_bucket_width() {
        let mut config = AppConfig::default();
        config.buffer.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.bucket_width_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_table_names_that_are_not_identifiers() {
        let mut config = AppConfig::default();
        config.store.metrics_table = "metrics; DROP TABLE x".into();
        assert!(config.validate().is_err());

        assert!(is_identifier("request_metrics"));
        assert!(is_identifier("_t1"));
        assert!(!is_identifier("1t"));
        assert!(!is_identifier(""));
    }
}
