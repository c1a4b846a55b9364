use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest request path kept on an entry, in characters. Matches the width of
/// the `path` column created by the schema provisioning.
pub const MAX_PATH_LEN: usize = 2048;

/// Status code that counts as a successful request. Everything else is a
/// failure, including other 2xx codes.
pub const SUCCESS_STATUS: u16 = 200;

/// One observed request outcome.
///
/// Entries are created once by the capture point and then moved through the
/// pipeline: buffer → flush loop → durable store. Fields are private so an
/// entry cannot be altered after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawEntry")]
pub struct Entry {
    id: Uuid,
    timestamp: DateTime<Utc>,
    duration_ms: u64,
    status_code: u16,
    path: String,
}

impl Entry {
    /// Builds an entry stamped with the current time and a fresh id.
    pub fn capture(duration_ms: u64, status_code: u16, path: &str) -> Self {
        Self::new(Utc::now(), duration_ms, status_code, path)
    }

    /// Builds an entry for an explicit capture instant.
    pub fn new(timestamp: DateTime<Utc>, duration_ms: u64, status_code: u16, path: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            duration_ms,
            status_code,
            path: truncate_path(path),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_success(&self) -> bool {
        self.status_code == SUCCESS_STATUS
    }
}

/// Wire shape of an [`Entry`]. Decoded entries pass through the same path
/// limit as captured ones.
#[derive(Deserialize)]
struct RawEntry {
    id: Uuid,
    timestamp: DateTime<Utc>,
    duration_ms: u64,
    status_code: u16,
    path: String,
}

impl From<RawEntry> for Entry {
    fn from(raw: RawEntry) -> Self {
        let path = if raw.path.chars().count() > MAX_PATH_LEN {
            truncate_path(&raw.path)
        } else {
            raw.path
        };
        Self {
            id: raw.id,
            timestamp: raw.timestamp,
            duration_ms: raw.duration_ms,
            status_code: raw.status_code,
            path,
        }
    }
}

fn truncate_path(path: &str) -> String {
    match path.char_indices().nth(MAX_PATH_LEN) {
        Some((cut, _)) => path[..cut].to_owned(),
        None => path.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn only_200_counts_as_success() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        assert!(Entry::new(ts, 3, 200, "/").is_success());
        assert!(!Entry::new(ts, 3, 201, "/").is_success());
        assert!(!Entry::new(ts, 3, 404, "/").is_success());
        assert!(!Entry::new(ts, 3, 500, "/").is_success());
    }

    #[test]
    fn long_paths_are_truncated_not_rejected() {
        let long = "é".repeat(MAX_PATH_LEN + 10);
        let entry = Entry::capture(1, 200, &long);
        assert_eq!(entry.path().chars().count(), MAX_PATH_LEN);

        let short = Entry::capture(1, 200, "/api/users/42");
        assert_eq!(short.path(), "/api/users/42");
    }

    #[test]
    fn decoded_entries_keep_the_path_limit() {
        let entry = Entry::capture(7, 404, "/short");
        let mut json = serde_json::to_value(&entry).unwrap();
        json["path"] = serde_json::Value::String(format!("/{}", "x".repeat(MAX_PATH_LEN + 500)));

        let decoded: Entry = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.path().chars().count(), MAX_PATH_LEN);
        assert_eq!(decoded.id(), entry.id());
        assert_eq!(decoded.status_code(), 404);
    }

    #[test]
    fn encoded_entries_decode_unchanged() {
        let entry = Entry::capture(12, 200, "/api/simulate");
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(serde_json::from_str::<Entry>(&json).unwrap(), entry);
    }

    #[test]
    fn every_entry_gets_a_distinct_id() {
        let a = Entry::capture(1, 200, "/a");
        let b = Entry::capture(1, 200, "/a");
        assert_ne!(a.id(), b.id());
    }
}
