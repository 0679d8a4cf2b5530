//! Transport primitives the sampling engine and streaming session depend on.
//!
//! Everything above this module talks to a partitioned log only through
//! [`LogTransport`] and [`LogReader`], so the Kafka client can be swapped for
//! the in-memory log in tests.

use super::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pii_sampler_types::OffsetReset;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A topic/partition pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// A message as fetched from the log, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Where a reader should continue from on a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Offset(i64),
    Earliest,
    Latest,
}

impl From<OffsetReset> for Position {
    fn from(reset: OffsetReset) -> Self {
        match reset {
            OffsetReset::Earliest => Position::Earliest,
            OffsetReset::Latest => Position::Latest,
        }
    }
}

/// Cluster-level operations and reader construction.
#[async_trait]
pub trait LogTransport: Send + Sync + 'static {
    type Reader: LogReader + 'static;

    /// All topic names known to the cluster.
    async fn list_topics(&self) -> Result<Vec<String>>;

    /// Partition ids of `topic`, empty when the topic does not exist.
    async fn list_partitions(&self, topic: &str) -> Result<Vec<i32>>;

    /// `(low, high)` watermarks; `high` is the offset the next write gets.
    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64)>;

    /// Open a fresh connection acting on behalf of `group_id`.
    async fn open_reader(&self, group_id: &str) -> Result<Self::Reader>;
}

/// A single connection reading from one or more partitions.
#[async_trait]
pub trait LogReader: Send {
    /// Group-managed consumption of `topics`. Partitions without a committed
    /// group offset start at `reset`.
    async fn subscribe(&mut self, topics: &[String], reset: OffsetReset) -> Result<()>;

    /// Read `partition` from `position` on the next poll. Adds the partition
    /// to the reader's assignment if it is not there yet.
    async fn seek(&mut self, topic: &str, partition: i32, position: Position) -> Result<()>;

    /// Wait up to `timeout` for messages. An empty batch is not an error.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<RawMessage>>;

    /// Commit the next offsets to consume for the reader's group.
    async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()>;
}
