//! Durable offset tracking for the streaming session.
//!
//! The [`OffsetManager`] keeps the next offset to consume per partition,
//! decides when the commit cadence is due, and writes committed offsets to an
//! [`OffsetStore`]. At startup the stored offsets take precedence over the
//! broker's group offsets.

use super::transport::TopicPartition;
use crate::error::{StateError, StateResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Committed position of one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetEntry {
    /// Next offset to consume
    pub offset: i64,
    pub updated_at: DateTime<Utc>,
}

impl OffsetEntry {
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            updated_at: Utc::now(),
        }
    }
}

pub type OffsetMap = HashMap<TopicPartition, OffsetEntry>;

/// Trait for durable offset backends.
///
/// A store is owned by one streaming session at a time; concurrent writers
/// are not supported.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Read every stored offset.
    ///
    /// # Returns
    /// * `Ok(map)` - Stored offsets, empty when nothing was stored yet
    /// * `Err(StateError)` - The backing storage is unreadable or corrupt
    async fn load(&self) -> StateResult<OffsetMap>;

    /// Replace the stored set with `offsets`.
    async fn persist(&self, offsets: &OffsetMap) -> StateResult<()>;
}

/// In-memory offset store
///
/// Suitable for tests and for sessions that rely on broker offsets only.
#[derive(Default)]
pub struct InMemoryOffsetStore {
    offsets: DashMap<TopicPartition, OffsetEntry>,
    persist_failures: AtomicUsize,
    persists: AtomicUsize,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offsets(offsets: impl IntoIterator<Item = (TopicPartition, i64)>) -> Self {
        let store = Self::new();
        for (tp, offset) in offsets {
            store.offsets.insert(tp, OffsetEntry::new(offset));
        }
        store
    }

    pub fn get(&self, tp: &TopicPartition) -> Option<i64> {
        self.offsets.get(tp).map(|e| e.offset)
    }

    /// Make the next `n` persists fail.
    pub fn fail_next_persists(&self, n: usize) {
        self.persist_failures.store(n, Ordering::SeqCst);
    }

    pub fn persist_count(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn load(&self) -> StateResult<OffsetMap> {
        Ok(self
            .offsets
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }

    async fn persist(&self, offsets: &OffsetMap) -> StateResult<()> {
        let failed = self
            .persist_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StateError::Io {
                path: "memory".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected persist failure"),
            });
        }

        self.offsets.clear();
        for (tp, entry) in offsets {
            self.offsets.insert(tp.clone(), entry.clone());
        }
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

const OFFSET_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct OffsetFile {
    version: u32,
    offsets: Vec<StoredOffset>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredOffset {
    topic: String,
    partition: i32,
    offset: i64,
    updated_at: DateTime<Utc>,
}

/// Accepted on-disk layouts. The legacy layout is `{topic: {partition: offset}}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OnDisk {
    Current(OffsetFile),
    Legacy(BTreeMap<String, BTreeMap<String, i64>>),
}

/// JSON file offset store
///
/// The whole set is rewritten on every persist through a temporary file and
/// a rename, so a crash mid-write leaves the previous version intact.
pub struct FileOffsetStore {
    path: PathBuf,
}

impl FileOffsetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }

    fn decode(&self, bytes: &[u8]) -> StateResult<OffsetMap> {
        let on_disk: OnDisk = serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
            path: self.display_path(),
            reason: e.to_string(),
        })?;

        match on_disk {
            OnDisk::Current(file) => Ok(file
                .offsets
                .into_iter()
                .map(|o| {
                    (
                        TopicPartition::new(o.topic, o.partition),
                        OffsetEntry {
                            offset: o.offset,
                            updated_at: o.updated_at,
                        },
                    )
                })
                .collect()),
            OnDisk::Legacy(topics) => {
                let mut offsets = OffsetMap::new();
                for (topic, partitions) in topics {
                    for (partition, offset) in partitions {
                        let partition: i32 =
                            partition.parse().map_err(|_| StateError::Corrupt {
                                path: self.display_path(),
                                reason: format!("invalid partition id '{partition}' for {topic}"),
                            })?;
                        offsets.insert(
                            TopicPartition::new(topic.clone(), partition),
                            OffsetEntry::new(offset),
                        );
                    }
                }
                Ok(offsets)
            }
        }
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self) -> StateResult<OffsetMap> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No offset file");
                return Ok(OffsetMap::new());
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.display_path(),
                    source,
                })
            }
        };

        self.decode(&bytes)
    }

    async fn persist(&self, offsets: &OffsetMap) -> StateResult<()> {
        let mut stored: Vec<StoredOffset> = offsets
            .iter()
            .map(|(tp, entry)| StoredOffset {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: entry.offset,
                updated_at: entry.updated_at,
            })
            .collect();
        stored.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));

        let body = serde_json::to_vec_pretty(&OffsetFile {
            version: OFFSET_FILE_VERSION,
            offsets: stored,
        })?;

        let io_err = |source| StateError::Io {
            path: self.display_path(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

/// Statistics about offset management
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OffsetStats {
    pub successful_commits: u64,
    pub failed_commits: u64,
    pub total_offsets_committed: u64,
    pub failed_persists: u64,
    pub last_commit_time: Option<DateTime<Utc>>,
}

/// Tracks processed positions and the commit cadence for one session.
pub struct OffsetManager<S: OffsetStore> {
    store: Arc<S>,
    commit_interval: u64,
    /// Next offset to consume, not yet committed
    pending: HashMap<TopicPartition, i64>,
    /// Last committed (and restored) positions
    committed: OffsetMap,
    since_commit: u64,
    stats: OffsetStats,
}

impl<S: OffsetStore> OffsetManager<S> {
    pub fn new(store: Arc<S>, commit_interval: u64) -> Self {
        Self {
            store,
            commit_interval: commit_interval.max(1),
            pending: HashMap::new(),
            committed: OffsetMap::new(),
            since_commit: 0,
            stats: OffsetStats::default(),
        }
    }

    /// Load stored offsets and return those that belong to `topics`.
    ///
    /// A missing or corrupt store is not an error: the session then falls
    /// back to its reset policy.
    pub async fn restore(&mut self, topics: &[String]) -> Vec<(TopicPartition, i64)> {
        match self.store.load().await {
            Ok(loaded) => self.committed = loaded,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable offset store, falling back to offset reset policy");
                self.committed.clear();
            }
        }

        let mut resume: Vec<(TopicPartition, i64)> = self
            .committed
            .iter()
            .filter(|(tp, _)| topics.contains(&tp.topic))
            .map(|(tp, entry)| (tp.clone(), entry.offset))
            .collect();
        resume.sort();

        info!(stored = self.committed.len(), resumable = resume.len(), "Restored offsets");
        resume
    }

    /// Record that `offset` was processed.
    pub fn track(&mut self, topic: &str, partition: i32, offset: i64) {
        let next = offset + 1;
        self.pending
            .entry(TopicPartition::new(topic, partition))
            .and_modify(|current| *current = (*current).max(next))
            .or_insert(next);
        self.since_commit += 1;
    }

    /// Whether `commit_interval` records were processed since the last commit.
    pub fn should_commit(&self) -> bool {
        self.since_commit >= self.commit_interval
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn since_commit(&self) -> u64 {
        self.since_commit
    }

    /// Pending offsets in `(topic, partition)` order.
    pub fn pending_offsets(&self) -> Vec<(TopicPartition, i64)> {
        let mut offsets: Vec<_> = self
            .pending
            .iter()
            .map(|(tp, next)| (tp.clone(), *next))
            .collect();
        offsets.sort();
        offsets
    }

    /// Promote pending offsets after the broker accepted them.
    pub fn mark_committed(&mut self) {
        let now = Utc::now();
        let count = self.pending.len() as u64;
        for (tp, offset) in self.pending.drain() {
            self.committed.insert(
                tp,
                OffsetEntry {
                    offset,
                    updated_at: now,
                },
            );
        }
        self.since_commit = 0;
        self.stats.successful_commits += 1;
        self.stats.total_offsets_committed += count;
        self.stats.last_commit_time = Some(now);
    }

    pub fn record_commit_failure(&mut self) {
        self.stats.failed_commits += 1;
    }

    /// Write the committed set to the durable store.
    pub async fn persist(&mut self) -> StateResult<()> {
        let result = self.store.persist(&self.committed).await;
        if result.is_err() {
            self.stats.failed_persists += 1;
        }
        result
    }

    pub fn committed(&self) -> &OffsetMap {
        &self.committed
    }

    pub fn committed_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.committed.get(tp).map(|e| e.offset)
    }

    pub fn stats(&self) -> &OffsetStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_in_memory_store_round_trip() {
        let store = InMemoryOffsetStore::new();
        let mut offsets = OffsetMap::new();
        offsets.insert(TopicPartition::new("t", 0), OffsetEntry::new(42));

        store.persist(&offsets).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[&TopicPartition::new("t", 0)].offset, 42);
        assert_eq!(store.persist_count(), 1);
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileOffsetStore::new(dir.path().join("offsets.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persist_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("offsets.json");
        let store = FileOffsetStore::new(&path);

        let mut offsets = OffsetMap::new();
        offsets.insert(TopicPartition::new("orders", 1), OffsetEntry::new(17));
        offsets.insert(TopicPartition::new("orders", 0), OffsetEntry::new(5));
        store.persist(&offsets).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["offsets"][0]["partition"], 0);

        let reloaded = FileOffsetStore::new(&path).load().await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded[&TopicPartition::new("orders", 1)].offset, 17);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_reads_legacy_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        std::fs::write(&path, r#"{"users": {"0": 10, "3": 99}}"#).unwrap();

        let loaded = FileOffsetStore::new(&path).load().await.unwrap();
        assert_eq!(loaded[&TopicPartition::new("users", 3)].offset, 99);
        assert_eq!(loaded[&TopicPartition::new("users", 0)].offset, 10);
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = FileOffsetStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_manager_restore_falls_back_on_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        std::fs::write(&path, "garbage").unwrap();

        let mut manager = OffsetManager::new(Arc::new(FileOffsetStore::new(&path)), 10);
        assert!(manager.restore(&["t".to_string()]).await.is_empty());
        assert!(manager.committed().is_empty());
    }

    #[tokio::test]
    async fn test_manager_restore_filters_topics() {
        let store = Arc::new(InMemoryOffsetStore::with_offsets([
            (TopicPartition::new("a", 0), 3),
            (TopicPartition::new("b", 0), 8),
        ]));
        let mut manager = OffsetManager::new(store, 10);

        let resume = manager.restore(&["a".to_string()]).await;
        assert_eq!(resume, vec![(TopicPartition::new("a", 0), 3)]);
        // Other topics are kept so a persist does not drop them.
        assert_eq!(manager.committed().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_cadence() {
        let store = Arc::new(InMemoryOffsetStore::new());
        let mut manager = OffsetManager::new(Arc::clone(&store), 3);

        manager.track("t", 0, 0);
        manager.track("t", 1, 0);
        assert!(!manager.should_commit());
        manager.track("t", 0, 1);
        assert!(manager.should_commit());

        assert_eq!(
            manager.pending_offsets(),
            vec![(TopicPartition::new("t", 0), 2), (TopicPartition::new("t", 1), 1)]
        );

        manager.mark_committed();
        manager.persist().await.unwrap();
        assert!(!manager.has_pending());
        assert_eq!(manager.since_commit(), 0);
        assert_eq!(store.get(&TopicPartition::new("t", 0)), Some(2));
        assert_eq!(manager.stats().successful_commits, 1);
        assert_eq!(manager.stats().total_offsets_committed, 2);
    }

    #[tokio::test]
    async fn test_track_never_moves_backwards() {
        let mut manager = OffsetManager::new(Arc::new(InMemoryOffsetStore::new()), 100);
        manager.track("t", 0, 9);
        manager.track("t", 0, 4);
        assert_eq!(manager.pending_offsets(), vec![(TopicPartition::new("t", 0), 10)]);
    }

    #[tokio::test]
    async fn test_persist_failure_is_counted() {
        let store = Arc::new(InMemoryOffsetStore::new());
        store.fail_next_persists(1);
        let mut manager = OffsetManager::new(Arc::clone(&store), 1);
        manager.track("t", 0, 0);
        manager.mark_committed();

        assert!(manager.persist().await.is_err());
        assert_eq!(manager.stats().failed_persists, 1);
        assert!(manager.persist().await.is_ok());
    }
}
