//! JSONL audit store with date rotation and bounded in-memory tail.
//!
//! One file per UTC date under the configured directory, `YYYY-MM-DD.jsonl`,
//! one JSON record per line, flushed per write. The directory is created
//! `0o750`, files `0o640`. The last [`MAX_MEMORY_RECORDS`] records stay in a
//! ring for queries and stats; subscribers get a bounded channel each and
//! lose records instead of stalling the write path.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{AuditError, AuditRecord, AuditStats, AuditStore, QueryFilter};
use crate::Verdict;

/// In-memory ring capacity.
pub const MAX_MEMORY_RECORDS: usize = 10_000;

/// Per-subscriber channel capacity.
pub const SUBSCRIBER_BUFFER: usize = 100;

type SubscriberMap = Arc<Mutex<HashMap<u64, mpsc::Sender<AuditRecord>>>>;

/// The JSONL-backed [`AuditStore`].
pub struct JsonlStore {
    dir: PathBuf,
    inner: Mutex<StoreInner>,
    subscribers: SubscriberMap,
    next_subscriber: AtomicU64,
}

struct StoreInner {
    current_date: String,
    writer: Option<BufWriter<File>>,
    ring: VecDeque<AuditRecord>,
}

/// Handle tied to one subscription; dropping it detaches the channel.
pub struct Subscription {
    subscribers: SubscriberMap,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.lock().remove(&self.id);
    }
}

impl JsonlStore {
    /// Create the store, creating `dir` (mode `0o750`) if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let dir = dir.into();

        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o750);
        }
        builder.create(&dir).map_err(|source| AuditError::CreateDir {
            dir: dir.display().to_string(),
            source,
        })?;

        Ok(Self {
            dir,
            inner: Mutex::new(StoreInner {
                current_date: String::new(),
                writer: None,
                ring: VecDeque::new(),
            }),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(0),
        })
    }

    fn rotate(&self, inner: &mut StoreInner, date: &str) -> Result<(), AuditError> {
        if let Some(writer) = inner.writer.as_mut() {
            writer.flush()?;
        }

        let path = self.dir.join(format!("{date}.jsonl"));
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o640);
        }
        let file = options.open(&path).map_err(|source| AuditError::OpenFile {
            path: path.display().to_string(),
            source,
        })?;

        inner.writer = Some(BufWriter::new(file));
        inner.current_date = date.to_string();
        Ok(())
    }

    fn notify_subscribers(&self, record: &AuditRecord) {
        let subscribers = self.subscribers.lock();
        for sender in subscribers.values() {
            // Drop-on-full: a slow reader must not stall the hot path.
            let _ = sender.try_send(record.clone());
        }
    }
}

impl AuditStore for JsonlStore {
    fn write(&self, mut record: AuditRecord) -> Result<(), AuditError> {
        let now = Utc::now();
        if record.id.is_empty() {
            record.id = now.timestamp_nanos_opt().unwrap_or_default().to_string();
        }

        let mut inner = self.inner.lock();

        let date = record.timestamp.format("%Y-%m-%d").to_string();
        if date != inner.current_date {
            self.rotate(&mut inner, &date)?;
        }

        let line = serde_json::to_vec(&record)?;
        // rotate() above guarantees a writer when the lock is held.
        if let Some(writer) = inner.writer.as_mut() {
            writer.write_all(&line)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }

        if inner.ring.len() >= MAX_MEMORY_RECORDS {
            inner.ring.pop_front();
        }
        inner.ring.push_back(record.clone());
        drop(inner);

        self.notify_subscribers(&record);
        Ok(())
    }

    fn query(&self, filter: &QueryFilter) -> Vec<AuditRecord> {
        let inner = self.inner.lock();
        let matched = inner.ring.iter().filter(|r| filter.matches(r));

        let mut results: Vec<AuditRecord> = matched.skip(filter.offset).cloned().collect();
        if filter.limit > 0 {
            results.truncate(filter.limit);
        }
        results
    }

    fn stats(&self) -> AuditStats {
        let inner = self.inner.lock();
        let mut stats = AuditStats::default();

        for record in &inner.ring {
            stats.total_requests += 1;
            match record.verdict {
                Verdict::Allow => stats.allow_count += 1,
                Verdict::Deny => stats.deny_count += 1,
                Verdict::Ask => stats.ask_count += 1,
                Verdict::Log => stats.log_count += 1,
            }
            if !record.method.is_empty() {
                *stats.by_method.entry(record.method.clone()).or_default() += 1;
            }
            if !record.tool.is_empty() {
                *stats.by_tool.entry(record.tool.clone()).or_default() += 1;
            }
        }

        stats
    }

    fn subscribe(&self) -> (mpsc::Receiver<AuditRecord>, Subscription) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, tx);
        (
            rx,
            Subscription {
                subscribers: self.subscribers.clone(),
                id,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Direction;
    use chrono::TimeZone;

    fn record(method: &str, tool: &str, verdict: Verdict) -> AuditRecord {
        AuditRecord {
            id: String::new(),
            timestamp: Utc::now(),
            direction: Direction::Inbound,
            method: method.to_string(),
            tool: tool.to_string(),
            arguments: None,
            verdict,
            rule: "r".to_string(),
            message: String::new(),
            raw_size: 10,
            duration_us: 5,
        }
    }

    #[test]
    fn test_write_creates_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("logs")).unwrap();
        store.write(record("initialize", "", Verdict::Allow)).unwrap();

        let date = Utc::now().format("%Y-%m-%d").to_string();
        let path = dir.path().join("logs").join(format!("{date}.jsonl"));
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 1);

        let parsed: AuditRecord = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.method, "initialize");
        assert!(!parsed.id.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_and_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let store = JsonlStore::new(&logs).unwrap();
        store.write(record("ping", "", Verdict::Allow)).unwrap();

        let dir_mode = std::fs::metadata(&logs).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o750);

        let date = Utc::now().format("%Y-%m-%d").to_string();
        let file_mode = std::fs::metadata(logs.join(format!("{date}.jsonl")))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o640);
    }

    #[test]
    fn test_rotation_on_date_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("logs")).unwrap();

        let mut old = record("initialize", "", Verdict::Allow);
        old.timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        store.write(old).unwrap();

        let mut new = record("initialize", "", Verdict::Allow);
        new.timestamp = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 1).unwrap();
        store.write(new).unwrap();

        assert!(dir.path().join("logs/2024-03-01.jsonl").exists());
        assert!(dir.path().join("logs/2024-03-02.jsonl").exists());
    }

    #[test]
    fn test_query_filters_offset_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("logs")).unwrap();

        for i in 0..5 {
            let verdict = if i % 2 == 0 { Verdict::Allow } else { Verdict::Deny };
            store.write(record("tools/call", "read_file", verdict)).unwrap();
        }
        store.write(record("initialize", "", Verdict::Allow)).unwrap();

        let denied = store.query(&QueryFilter {
            verdict: Some(Verdict::Deny),
            ..Default::default()
        });
        assert_eq!(denied.len(), 2);

        let by_method = store.query(&QueryFilter {
            method: Some("tools/call".to_string()),
            ..Default::default()
        });
        assert_eq!(by_method.len(), 5);

        let paged = store.query(&QueryFilter {
            method: Some("tools/call".to_string()),
            offset: 1,
            limit: 2,
            ..Default::default()
        });
        assert_eq!(paged.len(), 2);

        let by_tool = store.query(&QueryFilter {
            tool: Some("write_file".to_string()),
            ..Default::default()
        });
        assert!(by_tool.is_empty());
    }

    #[test]
    fn test_query_time_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("logs")).unwrap();

        let mut early = record("a", "", Verdict::Allow);
        early.timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut late = record("b", "", Verdict::Allow);
        late.timestamp = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        store.write(early).unwrap();
        store.write(late).unwrap();

        let results = store.query(&QueryFilter {
            since: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        });
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].method, "b");

        let results = store.query(&QueryFilter {
            until: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        });
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].method, "a");
    }

    #[test]
    fn test_stats_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("logs")).unwrap();

        store.write(record("tools/call", "read_file", Verdict::Allow)).unwrap();
        store.write(record("tools/call", "read_file", Verdict::Deny)).unwrap();
        store.write(record("tools/call", "write_file", Verdict::Ask)).unwrap();
        store.write(record("initialize", "", Verdict::Log)).unwrap();

        let stats = store.stats();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.allow_count, 1);
        assert_eq!(stats.deny_count, 1);
        assert_eq!(stats.ask_count, 1);
        assert_eq!(stats.log_count, 1);
        assert_eq!(stats.by_method["tools/call"], 3);
        assert_eq!(stats.by_tool["read_file"], 2);
        assert!(!stats.by_tool.contains_key(""));
    }

    #[tokio::test]
    async fn test_subscribe_receives_and_detaches() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("logs")).unwrap();

        let (mut rx, sub) = store.subscribe();
        store.write(record("tools/call", "read_file", Verdict::Allow)).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.tool, "read_file");

        drop(sub);
        store.write(record("tools/call", "read_file", Verdict::Allow)).unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("logs")).unwrap();

        let (mut rx, _sub) = store.subscribe();
        for _ in 0..(SUBSCRIBER_BUFFER + 50) {
            store.write(record("ping", "", Verdict::Allow)).unwrap();
        }

        // The writer never blocked; the reader sees at most the buffer.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[test]
    fn test_ring_is_bounded_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("logs")).unwrap();

        for i in 0..(MAX_MEMORY_RECORDS + 5) {
            let method = if i < 5 { "early" } else { "late" };
            store.write(record(method, "", Verdict::Allow)).unwrap();
        }

        let stats = store.stats();
        assert_eq!(stats.total_requests, MAX_MEMORY_RECORDS);
        // The first five writes fell off the ring; the file kept everything.
        assert!(!stats.by_method.contains_key("early"));

        let date = Utc::now().format("%Y-%m-%d").to_string();
        let contents =
            std::fs::read_to_string(dir.path().join("logs").join(format!("{date}.jsonl")))
                .unwrap();
        assert_eq!(contents.lines().count(), MAX_MEMORY_RECORDS + 5);
    }
}
