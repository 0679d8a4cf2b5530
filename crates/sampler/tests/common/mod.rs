//! Shared fixtures for the sampler integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pii_sampler::kafka::MemoryTransport;
use pii_sampler::sampling::CancellationFlag;
use pii_sampler::streaming::{RecordHandler, StreamingConfig};
use pii_sampler::{RawMessage, SamplerError};
use pii_sampler_types::OffsetReset;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Create `topic` with `partitions` partitions of `per_partition` user records.
pub fn seed_topic(transport: &MemoryTransport, topic: &str, partitions: usize, per_partition: usize) {
    transport.create_topic(topic, partitions);
    for partition in 0..partitions as i32 {
        for i in 0..per_partition {
            transport.produce_json(
                topic,
                partition,
                &json!({
                    "id": i,
                    "email": format!("user{i}@example.com"),
                    "amount": i * 10,
                }),
            );
        }
    }
}

/// Fast-cycling streaming settings for tests
pub fn streaming_config(commit_interval: u64) -> StreamingConfig {
    StreamingConfig {
        commit_interval,
        poll_timeout: Duration::from_millis(10),
        offset_reset: OffsetReset::Earliest,
        failure_threshold: 3,
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        backoff_jitter: 0.0,
        ..StreamingConfig::default()
    }
}

/// Records every offset it sees and stops the session after `stop_after` records.
pub struct RecordingHandler {
    pub seen: Mutex<Vec<(i32, i64)>>,
    shutdown: CancellationFlag,
    stop_after: usize,
    fail_odd: bool,
}

impl RecordingHandler {
    /// Cancel `shutdown` once `stop_after` records were handled.
    pub fn new(shutdown: CancellationFlag, stop_after: usize) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            shutdown,
            stop_after,
            fail_odd: false,
        }
    }

    /// Fail every record with an odd offset.
    pub fn failing_odd(mut self) -> Self {
        self.fail_odd = true;
        self
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.seen.lock().iter().map(|(_, offset)| *offset).collect()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn handle(&self, message: &RawMessage) -> pii_sampler::Result<()> {
        let count = {
            let mut seen = self.seen.lock();
            seen.push((message.partition, message.offset));
            seen.len()
        };
        if count >= self.stop_after {
            self.shutdown.cancel();
        }
        if self.fail_odd && message.offset % 2 == 1 {
            return Err(SamplerError::handler(format!("bad record {}", message.offset)));
        }
        Ok(())
    }
}

/// Handles `limit` records, then signals and hangs, standing in for a
/// process that dies mid-stream.
pub struct CrashingHandler {
    pub seen: Mutex<Vec<i64>>,
    limit: usize,
    pub crashed: Arc<Notify>,
}

impl CrashingHandler {
    pub fn new(limit: usize) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            limit,
            crashed: Arc::new(Notify::new()),
        }
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.seen.lock().last().copied()
    }
}

#[async_trait]
impl RecordHandler for CrashingHandler {
    async fn handle(&self, message: &RawMessage) -> pii_sampler::Result<()> {
        {
            let mut seen = self.seen.lock();
            if seen.len() < self.limit {
                seen.push(message.offset);
                return Ok(());
            }
        }
        self.crashed.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}
