//! In-process partitioned log implementing the transport traits.
//!
//! Offsets, watermarks and group commits behave like a single broker. Failure
//! and latency injection make it usable for exercising the scanner, the
//! coordinator and the streaming session without a cluster.

use super::error::{KafkaError, Result};
use super::transport::{LogReader, LogTransport, Position, RawMessage, TopicPartition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use pii_sampler_types::OffsetReset;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BROKER: &str = "memory";

/// Upper bound on how long an empty poll waits.
const EMPTY_POLL_WAIT: Duration = Duration::from_millis(5);

/// Messages are kept in offset order; offsets may have gaps after
/// compaction, so `high` is tracked separately.
#[derive(Default)]
struct PartitionLog {
    low: i64,
    high: i64,
    messages: Vec<RawMessage>,
}

impl PartitionLog {
    fn high(&self) -> i64 {
        self.high
    }

    /// Index of the first message at or after `offset`
    fn index_of(&self, offset: i64) -> usize {
        self.messages.partition_point(|m| m.offset < offset)
    }
}

#[derive(Default)]
struct Shared {
    topics: RwLock<BTreeMap<String, Vec<PartitionLog>>>,
    group_offsets: Mutex<HashMap<(String, TopicPartition), i64>>,
    batch_size: AtomicUsize,
    poll_latency: Mutex<Duration>,
    poll_failures: AtomicUsize,
    poll_grace: AtomicUsize,
    commit_failures: AtomicUsize,
    connect_failures: AtomicUsize,
    reads: Mutex<HashMap<TopicPartition, usize>>,
    total_polls: AtomicUsize,
    readers_opened: AtomicUsize,
}

/// Take one unit from an injected failure budget.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Cloneable handle to a shared in-memory log.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let shared = Shared::default();
        shared.batch_size.store(100, Ordering::Relaxed);
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Maximum messages returned by one poll.
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        self.shared
            .batch_size
            .store(batch_size.max(1), Ordering::Relaxed);
        self
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut topics = self.shared.topics.write();
        let logs = topics.entry(topic.to_string()).or_default();
        while logs.len() < partitions {
            logs.push(PartitionLog::default());
        }
    }

    pub fn delete_topic(&self, topic: &str) {
        self.shared.topics.write().remove(topic);
    }

    /// Append a message and return its offset.
    pub fn produce(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        self.produce_at(topic, partition, payload, Utc::now())
    }

    /// Append a message with an explicit timestamp.
    pub fn produce_at(
        &self,
        topic: &str,
        partition: i32,
        payload: impl Into<Vec<u8>>,
        timestamp: DateTime<Utc>,
    ) -> i64 {
        let mut topics = self.shared.topics.write();
        let logs = topics.entry(topic.to_string()).or_default();
        let index = partition.max(0) as usize;
        while logs.len() <= index {
            logs.push(PartitionLog::default());
        }
        let log = &mut logs[index];
        let offset = log.high;
        log.high += 1;
        log.messages.push(RawMessage {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
            payload: Some(payload.into()),
            timestamp: Some(timestamp),
        });
        offset
    }

    pub fn produce_json(&self, topic: &str, partition: i32, value: &serde_json::Value) -> i64 {
        self.produce(topic, partition, value.to_string())
    }

    /// Drop messages below `low`, as retention would.
    pub fn truncate(&self, topic: &str, partition: i32, low: i64) {
        let mut topics = self.shared.topics.write();
        if let Some(log) = topics
            .get_mut(topic)
            .and_then(|logs| logs.get_mut(partition as usize))
        {
            let low = low.clamp(log.low, log.high);
            let drop_count = log.index_of(low);
            log.messages.drain(..drop_count);
            log.low = low;
        }
    }

    /// Remove the messages whose offset fails `keep`, leaving the watermarks
    /// untouched, the way compaction or transaction markers leave offset gaps.
    pub fn compact(&self, topic: &str, partition: i32, keep: impl Fn(i64) -> bool) {
        let mut topics = self.shared.topics.write();
        if let Some(log) = topics
            .get_mut(topic)
            .and_then(|logs| logs.get_mut(partition as usize))
        {
            log.messages.retain(|m| keep(m.offset));
        }
    }

    /// Make the next `n` polls fail with a connection error.
    pub fn fail_next_polls(&self, n: usize) {
        self.fail_polls_after(0, n);
    }

    /// Let `grace` polls succeed, then fail the following `n`.
    pub fn fail_polls_after(&self, grace: usize, n: usize) {
        self.shared.poll_grace.store(grace, Ordering::SeqCst);
        self.shared.poll_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_commits(&self, n: usize) {
        self.shared.commit_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.shared.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Delay every poll by `latency`.
    pub fn set_poll_latency(&self, latency: Duration) {
        *self.shared.poll_latency.lock() = latency;
    }

    /// Polls that returned data from `topic:partition`.
    pub fn reads(&self, topic: &str, partition: i32) -> usize {
        self.shared
            .reads
            .lock()
            .get(&TopicPartition::new(topic, partition))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_polls(&self) -> usize {
        self.shared.total_polls.load(Ordering::SeqCst)
    }

    pub fn readers_opened(&self) -> usize {
        self.shared.readers_opened.load(Ordering::SeqCst)
    }

    pub fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared
            .group_offsets
            .lock()
            .get(&(group_id.to_string(), TopicPartition::new(topic, partition)))
            .copied()
    }

    fn bounds(&self, topic: &str, partition: i32) -> Option<(i64, i64)> {
        let topics = self.shared.topics.read();
        topics
            .get(topic)
            .and_then(|logs| logs.get(partition as usize))
            .map(|log| (log.low, log.high()))
    }
}

#[async_trait]
impl LogTransport for MemoryTransport {
    type Reader = MemoryReader;

    async fn list_topics(&self) -> Result<Vec<String>> {
        Ok(self.shared.topics.read().keys().cloned().collect())
    }

    async fn list_partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let topics = self.shared.topics.read();
        Ok(topics
            .get(topic)
            .map(|logs| (0..logs.len() as i32).collect())
            .unwrap_or_default())
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        self.bounds(topic, partition)
            .ok_or_else(|| KafkaError::partition_not_found(topic, partition))
    }

    async fn open_reader(&self, group_id: &str) -> Result<MemoryReader> {
        if take_failure(&self.shared.connect_failures) {
            return Err(KafkaError::connection("injected connect failure", BROKER));
        }
        self.shared.readers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryReader {
            transport: self.clone(),
            group_id: group_id.to_string(),
            assignment: Vec::new(),
            cursor: 0,
        })
    }
}

/// Reader over a [`MemoryTransport`].
pub struct MemoryReader {
    transport: MemoryTransport,
    group_id: String,
    assignment: Vec<(TopicPartition, i64)>,
    cursor: usize,
}

impl MemoryReader {
    fn resolve(&self, topic: &str, partition: i32, position: Position) -> Result<i64> {
        let (low, high) = self
            .transport
            .bounds(topic, partition)
            .ok_or_else(|| KafkaError::partition_not_found(topic, partition))?;
        Ok(match position {
            Position::Offset(offset) => offset,
            Position::Earliest => low,
            Position::Latest => high,
        })
    }

    fn assign(&mut self, tp: TopicPartition, next: i64) {
        match self.assignment.iter_mut().find(|(t, _)| *t == tp) {
            Some(entry) => entry.1 = next,
            None => self.assignment.push((tp, next)),
        }
    }
}

#[async_trait]
impl LogReader for MemoryReader {
    async fn subscribe(&mut self, topics: &[String], reset: OffsetReset) -> Result<()> {
        for topic in topics {
            let partitions = self.transport.list_partitions(topic).await?;
            for partition in partitions {
                let tp = TopicPartition::new(topic.clone(), partition);
                let committed = self.transport.committed(&self.group_id, topic, partition);
                let next = match committed {
                    Some(offset) => offset,
                    None => self.resolve(topic, partition, reset.into())?,
                };
                self.assign(tp, next);
            }
        }
        Ok(())
    }

    async fn seek(&mut self, topic: &str, partition: i32, position: Position) -> Result<()> {
        let next = self.resolve(topic, partition, position)?;
        self.assign(TopicPartition::new(topic, partition), next);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<RawMessage>> {
        let shared = &self.transport.shared;
        shared.total_polls.fetch_add(1, Ordering::SeqCst);

        let latency = *shared.poll_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !take_failure(&shared.poll_grace) && take_failure(&shared.poll_failures) {
            return Err(KafkaError::connection("injected poll failure", BROKER));
        }

        let batch_size = shared.batch_size.load(Ordering::Relaxed);
        let count = self.assignment.len();
        let mut batch = Vec::new();

        for step in 0..count {
            let index = (self.cursor + step) % count;
            let (tp, next) = &mut self.assignment[index];

            {
                let topics = shared.topics.read();
                let Some(log) = topics
                    .get(&tp.topic)
                    .and_then(|logs| logs.get(tp.partition as usize))
                else {
                    continue;
                };
                let start = (*next).max(log.low);
                if start >= log.high() {
                    continue;
                }
                let from = log.index_of(start);
                let to = (from + batch_size).min(log.messages.len());
                if from == to {
                    *next = log.high();
                    continue;
                }
                batch.extend_from_slice(&log.messages[from..to]);
                *next = log.messages[to - 1].offset + 1;
            }

            *shared.reads.lock().entry(tp.clone()).or_default() += 1;
            self.cursor = (index + 1) % count;
            break;
        }

        if batch.is_empty() {
            tokio::time::sleep(timeout.min(EMPTY_POLL_WAIT)).await;
        }
        Ok(batch)
    }

    async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        if take_failure(&self.transport.shared.commit_failures) {
            return Err(KafkaError::offset_commit(
                "injected commit failure",
                &self.group_id,
            ));
        }
        let mut group_offsets = self.transport.shared.group_offsets.lock();
        for (tp, next) in offsets {
            group_offsets.insert((self.group_id.clone(), tp.clone()), *next);
        }
        Ok(())
    }
}
