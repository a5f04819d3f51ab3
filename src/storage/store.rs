use crate::error::StorageError;
use crate::events::DetectionEvent;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Where an event ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPath(pub PathBuf);

impl StoredPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

/// Durable record of emitted events
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn persist(&self, event: &DetectionEvent) -> Result<StoredPath, StorageError>;
}

/// Appends one JSON object per line to `<root>/events/<YYYYMMDD>.jsonl`
pub struct JsonlEventStore {
    root: PathBuf,
    append_lock: tokio::sync::Mutex<()>,
}

impl JsonlEventStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            append_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn day_file(&self, day: NaiveDate) -> PathBuf {
        self.root
            .join("events")
            .join(format!("{}.jsonl", day.format("%Y%m%d")))
    }

    /// Every event recorded for `day`, in append order
    pub async fn load_day(&self, day: NaiveDate) -> Result<Vec<DetectionEvent>, StorageError> {
        let path = self.day_file(day);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StorageError::from))
            .collect()
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn persist(&self, event: &DetectionEvent) -> Result<StoredPath, StorageError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let path = self.day_file(event.timestamp.date_naive());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let _guard = self.append_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!("Persisted {} event {} to {}", event.kind, event.id, path.display());
        Ok(StoredPath(path))
    }
}

/// Keeps events in memory; for tests and embedding
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<DetectionEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DetectionEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn persist(&self, event: &DetectionEvent) -> Result<StoredPath, StorageError> {
        let mut events = self.events.lock();
        events.push(event.clone());
        Ok(StoredPath(PathBuf::from(format!("memory:{}", events.len() - 1))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::frame::BoundingBox;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn event_at(kind: EventKind, secs: i64) -> DetectionEvent {
        DetectionEvent::new(
            kind,
            Utc.timestamp_opt(secs, 0).unwrap(),
            secs as u64,
            vec![BoundingBox::new(0, 0, 10, 10)],
            100,
        )
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_per_day() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonlEventStore::new(temp_dir.path());

        // 2023-11-14
        let first = event_at(EventKind::MotionStarted, 1_700_000_000);
        let second = event_at(EventKind::MotionStopped, 1_700_000_010);
        let path = store.persist(&first).await.unwrap();
        store.persist(&second).await.unwrap();

        assert!(path.as_path().ends_with("events/20231114.jsonl"));

        let day = first.timestamp.date_naive();
        let loaded = store.load_day(day).await.unwrap();
        assert_eq!(loaded, vec![first, second]);
    }

    #[tokio::test]
    async fn test_jsonl_store_missing_day_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonlEventStore::new(temp_dir.path());
        let day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert!(store.load_day(day).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jsonl_store_unwritable_root_fails() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = JsonlEventStore::new(&blocker);
        let result = store.persist(&event_at(EventKind::Face, 1_700_000_000)).await;
        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    #[tokio::test]
    async fn test_memory_store_keeps_order() {
        let store = MemoryEventStore::new();
        store.persist(&event_at(EventKind::MotionStarted, 1)).await.unwrap();
        store.persist(&event_at(EventKind::Face, 2)).await.unwrap();

        let kinds: Vec<_> = store.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::MotionStarted, EventKind::Face]);
        assert_eq!(store.len(), 2);
    }
}
