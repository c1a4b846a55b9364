use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, RedisResult, Value};
use tracing::{debug, info, warn};

use super::{AddOutcome, Batch, IngestionBuffer};
use crate::config::RedisConfig;
use crate::entry::Entry;
use crate::error::{PipelineError, Result};
use crate::redis_client;

/// Stream field holding the JSON-encoded entry.
const ENTRY_FIELD: &str = "entry";

/// Id that starts a pending-list replay from the beginning.
const PENDING_START: &str = "0";

/// Id that asks the group for never-delivered entries.
const NEW_ENTRIES: &str = ">";

/// Durable buffer on top of a Redis stream and consumer group.
///
/// Delivery is at-least-once: entries stay in the group's pending list until
/// [`acknowledge`](IngestionBuffer::acknowledge) runs, and are read again
/// after a restart or an [`abandon`](IngestionBuffer::abandon).
pub struct RedisLogBuffer {
    writer: ConnectionManager,
    reader: ConnectionManager,
    stream_key: String,
    group: String,
    consumer: String,
    read_count: usize,
    add_timeout: Duration,
    max_len: Option<usize>,
    cursor: Mutex<ReadCursor>,
    rejected: AtomicU64,
}

/// Where the next `XREADGROUP` starts.
///
/// A fresh buffer starts in the pending list so a restart picks up whatever
/// the previous process read but never acknowledged. Once a pending read
/// comes back empty the cursor switches to new entries and stays there until
/// a batch is abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadCursor {
    /// Replaying this consumer's pending list, resuming after the id.
    Pending(String),
    New,
}

impl ReadCursor {
    fn start() -> Self {
        Self::Pending(PENDING_START.to_owned())
    }

    fn id(&self) -> &str {
        match self {
            Self::Pending(after) => after,
            Self::New => NEW_ENTRIES,
        }
    }

    /// Cursor after a read whose last record had id `last`.
    fn advance(&self, last: Option<&str>) -> Self {
        match (self, last) {
            (Self::Pending(_), Some(id)) => Self::Pending(id.to_owned()),
            (Self::Pending(_), None) | (Self::New, _) => Self::New,
        }
    }
}

impl RedisLogBuffer {
    /// Connects, then creates the stream and consumer group if missing.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let writer = redis_client::connect(&config.url).await?;
        let reader = redis_client::connect(&config.url).await?;

        let buffer = Self {
            writer,
            reader,
            stream_key: config.stream_key.clone(),
            group: config.group.clone(),
            consumer: config.consumer.clone(),
            read_count: config.read_count.max(1),
            add_timeout: Duration::from_millis(config.add_timeout_ms),
            max_len: config.max_len,
            cursor: Mutex::new(ReadCursor::start()),
            rejected: AtomicU64::new(0),
        };
        buffer.ensure_group().await?;
        Ok(buffer)
    }

    /// Group starts at `$`: entries already in the stream are not replayed.
    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.writer.clone();
        let created: RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream_key, &self.group, "$")
            .await;

        match created {
            Ok(()) => {
                info!(
                    stream = %self.stream_key,
                    group = %self.group,
                    "created consumer group"
                );
                Ok(())
            }
            Err(e) if is_busy_group(&e) => {
                debug!(group = %self.group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, payload: &str) -> RedisResult<String> {
        let mut conn = self.writer.clone();
        let fields = [(ENTRY_FIELD, payload)];
        match self.max_len {
            Some(n) => {
                conn.xadd_maxlen(&self.stream_key, StreamMaxlen::Approx(n), "*", &fields)
                    .await
            }
            None => conn.xadd(&self.stream_key, "*", &fields).await,
        }
    }

    async fn read_group(&self, id: &str, block: Option<Duration>) -> Result<Vec<StreamId>> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.read_count);
        if let Some(block) = block {
            // BLOCK 0 would wait forever.
            options = options.block((block.as_millis() as usize).max(1));
        }

        let mut conn = self.reader.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream_key], &[id], &options)
            .await?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    async fn read(&self, block: Option<Duration>) -> Result<Batch> {
        let cursor = self.cursor.lock().clone();

        let records = match cursor {
            ReadCursor::Pending(_) => {
                let records = self.read_group(cursor.id(), None).await?;
                let next = cursor.advance(records.last().map(|r| r.id.as_str()));
                *self.cursor.lock() = next.clone();
                if next == ReadCursor::New {
                    debug!(stream = %self.stream_key, "pending list replayed");
                    self.read_group(next.id(), block).await?
                } else {
                    records
                }
            }
            ReadCursor::New => self.read_group(cursor.id(), block).await?,
        };

        self.decode_batch(records).await
    }

    async fn decode_batch(&self, records: Vec<StreamId>) -> Result<Batch> {
        let mut entries = Vec::with_capacity(records.len());
        let mut receipts = Vec::with_capacity(records.len());
        let mut malformed = Vec::new();

        for record in records {
            match decode_record(&record.map) {
                Ok(entry) => {
                    entries.push(entry);
                    receipts.push(record.id);
                }
                Err(e) => {
                    warn!(id = %record.id, error = %e, "skipping undecodable stream record");
                    malformed.push(record.id);
                }
            }
        }

        // Nothing will ever decode these, so acknowledge them now rather than
        // replay them forever.
        if !malformed.is_empty() {
            let mut conn = self.reader.clone();
            let acked: RedisResult<i64> = conn
                .xack(&self.stream_key, &self.group, &malformed[..])
                .await;
            if let Err(e) = acked {
                warn!(error = %e, "failed to acknowledge malformed records");
            }
        }

        Ok(Batch::with_receipts(entries, receipts))
    }
}

#[async_trait]
impl IngestionBuffer for RedisLogBuffer {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn add(&self, entry: Entry) -> AddOutcome {
        let payload = match serde_json::to_string(&entry) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode entry");
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return AddOutcome::Rejected;
            }
        };

        match tokio::time::timeout(self.add_timeout, self.append(&payload)).await {
            Ok(Ok(_id)) => AddOutcome::Accepted,
            Ok(Err(e)) => {
                debug!(error = %e, "XADD failed");
                self.rejected.fetch_add(1, Ordering::Relaxed);
                AddOutcome::Rejected
            }
            Err(_) => {
                debug!(timeout_ms = self.add_timeout.as_millis() as u64, "XADD timed out");
                self.rejected.fetch_add(1, Ordering::Relaxed);
                AddOutcome::Rejected
            }
        }
    }

    async fn drain(&self) -> Result<Batch> {
        self.read(None).await
    }

    async fn wait_batch(&self, timeout: Duration) -> Result<Batch> {
        self.read(Some(timeout)).await
    }

    async fn acknowledge(&self, batch: &Batch) -> Result<()> {
        if batch.receipts().is_empty() {
            return Ok(());
        }
        let mut conn = self.reader.clone();
        let acked: i64 = conn
            .xack(&self.stream_key, &self.group, batch.receipts())
            .await?;
        debug!(acked, "acknowledged stream entries");
        Ok(())
    }

    async fn abandon(&self, batch: &Batch) {
        warn!(
            pending = batch.receipts().len(),
            "batch left unacknowledged; rewinding to pending list"
        );
        *self.cursor.lock() = ReadCursor::start();
    }

    fn dropped_entries(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// `XGROUP CREATE` on an existing group fails with `BUSYGROUP`; that race is
/// expected when several processes start together.
fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP") || err.to_string().contains("BUSYGROUP")
}

fn decode_record(fields: &HashMap<String, Value>) -> Result<Entry> {
    let raw = fields
        .get(ENTRY_FIELD)
        .ok_or_else(|| PipelineError::MalformedRecord(format!("missing '{ENTRY_FIELD}' field")))?;
    let payload: String = redis::from_redis_value(raw)?;
    Ok(serde_json::from_str(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::ErrorKind;

    fn record(payload: &str) -> HashMap<String, Value> {
        HashMap::from([(
            ENTRY_FIELD.to_owned(),
            Value::Data(payload.as_bytes().to_vec()),
        )])
    }

    #[test]
    fn decodes_an_encoded_entry() {
        let entry = Entry::capture(12, 404, "/missing");
        let payload = serde_json::to_string(&entry).unwrap();

        let decoded = decode_record(&record(&payload)).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn rejects_records_without_entry_field() {
        let fields = HashMap::from([("log".to_owned(), Value::Data(b"init".to_vec()))]);
        assert!(matches!(
            decode_record(&fields),
            Err(PipelineError::MalformedRecord(_))
        ));
    }

    #[test]
    fn rejects_records_with_garbage_payload() {
        assert!(matches!(
            decode_record(&record("init")),
            Err(PipelineError::Codec(_))
        ));
    }

    #[test]
    fn cursor_replays_pending_then_switches_to_new() {
        let start = ReadCursor::start();
        assert_eq!(start.id(), PENDING_START);

        let resumed = start.advance(Some("1700000000000-3"));
        assert_eq!(resumed, ReadCursor::Pending("1700000000000-3".into()));
        assert_eq!(resumed.id(), "1700000000000-3");

        let drained = resumed.advance(None);
        assert_eq!(drained, ReadCursor::New);
        assert_eq!(drained.id(), NEW_ENTRIES);
    }

    #[test]
    fn cursor_stays_on_new_entries_until_reset() {
        let cursor = ReadCursor::New;
        assert_eq!(cursor.advance(Some("5-0")), ReadCursor::New);
        assert_eq!(cursor.advance(None), ReadCursor::New);
    }

    #[test]
    fn busy_group_is_recognised() {
        let busy = RedisError::from((
            ErrorKind::ExtensionError,
            "BUSYGROUP",
            "Consumer Group name already exists".to_owned(),
        ));
        assert!(is_busy_group(&busy));

        let other = RedisError::from((
            ErrorKind::ResponseError,
            "WRONGTYPE",
            "Operation against a key holding the wrong kind of value".to_owned(),
        ));
        assert!(!is_busy_group(&other));
    }
}
