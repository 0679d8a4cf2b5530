//! Per-partition bounded scanning.
//!
//! A [`PartitionScanner`] reads one partition through its own reader and
//! returns at most the policy's sample target. With skip-based sampling it
//! seeks straight to evenly spaced offsets; otherwise it reads sequentially
//! and keeps every Nth message. Cancellation and the scan deadline are
//! checked between reads, never during one.

use super::decode::PayloadDecoder;
use crate::kafka::{LogReader, LogTransport, Position, RawMessage};
use chrono::Utc;
use pii_sampler_types::{OffsetReset, PartitionSamples, SampleRecord, SampleTarget, SamplingPolicy, SamplingStrategy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Consecutive empty polls after which a partition counts as exhausted.
const MAX_EMPTY_POLLS: u32 = 3;

/// Cooperative cancellation shared between a run and its scans.
///
/// A child flag observes every ancestor, so cancelling a topic does not
/// cancel its siblings while cancelling the run stops everything.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    own: Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing shutdown flag.
    pub fn from_shared(flag: Arc<AtomicBool>) -> Self {
        Self {
            own: flag,
            ancestors: Vec::new(),
        }
    }

    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.own));
        Self {
            own: Arc::new(AtomicBool::new(false)),
            ancestors,
        }
    }

    pub fn cancel(&self) {
        self.own.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::SeqCst) || self.ancestors.iter().any(|f| f.load(Ordering::SeqCst))
    }
}

/// Limits applied to one partition scan.
#[derive(Debug, Clone)]
pub struct ScanBudget {
    pub deadline: Option<Instant>,
    pub cancel: CancellationFlag,
}

impl ScanBudget {
    pub fn new(timeout: Option<Duration>, cancel: CancellationFlag) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            cancel,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None, CancellationFlag::new())
    }

    fn checkpoint(&self) -> Option<ScanStop> {
        if self.cancel.is_cancelled() {
            return Some(ScanStop::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ScanStop::Deadline),
            _ => None,
        }
    }
}

/// Why a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    TargetReached,
    /// The high watermark was reached before the target
    Exhausted,
    Cancelled,
    Deadline,
    ReadError,
}

/// Scan state for one partition, owned by a single scan.
#[derive(Debug, Clone)]
pub struct PartitionCursor {
    pub partition: i32,
    pub low: i64,
    pub high: i64,
    pub position: i64,
    pub collected: u64,
    /// Distance between kept offsets
    pub stride: i64,
}

impl PartitionCursor {
    fn size(&self) -> u64 {
        (self.high - self.low).max(0) as u64
    }
}

/// Result of scanning one partition.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub samples: PartitionSamples,
    pub stop: ScanStop,
    /// Poll calls issued against the partition
    pub polls: usize,
}

impl ScanOutcome {
    pub fn satisfied(&self) -> bool {
        self.samples.satisfied
    }
}

/// Settings shared by all scans of a run.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub poll_timeout: Duration,
    /// Consumer group the scan readers use. They never commit.
    pub group_id: String,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            group_id: "pii-sampler-scan".to_string(),
        }
    }
}

/// Scans single partitions of a topic according to a policy.
pub struct PartitionScanner<T: LogTransport> {
    transport: Arc<T>,
    policy: Arc<SamplingPolicy>,
    options: ScanOptions,
    decoder: PayloadDecoder,
}

impl<T: LogTransport> Clone for PartitionScanner<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            policy: Arc::clone(&self.policy),
            options: self.options.clone(),
            decoder: self.decoder.clone(),
        }
    }
}

struct ScanRun<'a, R> {
    reader: R,
    topic: &'a str,
    cursor: PartitionCursor,
    target: SampleTarget,
    samples: Vec<SampleRecord>,
    polls: usize,
    error: Option<String>,
}

impl<T: LogTransport> PartitionScanner<T> {
    pub fn new(transport: Arc<T>, policy: Arc<SamplingPolicy>, options: ScanOptions) -> Self {
        Self {
            transport,
            policy,
            options,
            decoder: PayloadDecoder::json(),
        }
    }

    /// Decode sampled payloads with `decoder` instead of plain JSON.
    pub fn with_decoder(mut self, decoder: PayloadDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn policy(&self) -> &SamplingPolicy {
        &self.policy
    }

    /// Scan `partition` of `topic` within `budget`.
    ///
    /// Read errors are not returned: the partition keeps whatever it
    /// collected and is reported unsatisfied.
    pub async fn scan(&self, topic: &str, partition: i32, budget: &ScanBudget) -> ScanOutcome {
        let (low, high) = match self.transport.watermarks(topic, partition).await {
            Ok(bounds) => bounds,
            Err(e) => {
                warn!(topic, partition, error = %e, "Failed to fetch watermarks, skipping partition");
                return ScanOutcome {
                    samples: PartitionSamples {
                        partition,
                        samples: Vec::new(),
                        satisfied: false,
                        low_watermark: 0,
                        high_watermark: 0,
                        error: Some(e.to_string()),
                    },
                    stop: ScanStop::ReadError,
                    polls: 0,
                };
            }
        };

        let size = (high - low).max(0) as u64;
        let target = self.policy.target(size);

        if size == 0 || target.limit == 0 {
            debug!(topic, partition, size, "Nothing to sample");
            return ScanOutcome {
                samples: PartitionSamples {
                    partition,
                    samples: Vec::new(),
                    satisfied: target.is_satisfied(0),
                    low_watermark: low,
                    high_watermark: high,
                    error: None,
                },
                stop: ScanStop::Exhausted,
                polls: 0,
            };
        }

        let reader = match self.transport.open_reader(&self.options.group_id).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(topic, partition, error = %e, "Failed to open reader, skipping partition");
                return ScanOutcome {
                    samples: PartitionSamples {
                        partition,
                        samples: Vec::new(),
                        satisfied: false,
                        low_watermark: low,
                        high_watermark: high,
                        error: Some(e.to_string()),
                    },
                    stop: ScanStop::ReadError,
                    polls: 0,
                };
            }
        };

        let mut run = ScanRun {
            reader,
            topic,
            cursor: PartitionCursor {
                partition,
                low,
                high,
                position: low,
                collected: 0,
                stride: 1,
            },
            target,
            samples: Vec::with_capacity(target.limit.min(size) as usize),
            polls: 0,
            error: None,
        };

        let started = Instant::now();
        let stop = if self.policy.skip_based() {
            self.skip_scan(&mut run, budget).await
        } else {
            self.sequential_scan(&mut run, budget).await
        };

        if let Some(error) = &run.error {
            warn!(
                topic,
                partition,
                collected = run.cursor.collected,
                error = %error,
                "Partial failure while scanning partition"
            );
        }

        let satisfied = stop != ScanStop::ReadError && run.target.is_satisfied(run.cursor.collected);
        debug!(
            topic,
            partition,
            collected = run.cursor.collected,
            target = run.target.limit,
            polls = run.polls,
            ?stop,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Partition scan finished"
        );

        ScanOutcome {
            samples: PartitionSamples {
                partition,
                samples: run.samples,
                satisfied,
                low_watermark: low,
                high_watermark: high,
                error: run.error,
            },
            stop,
            polls: run.polls,
        }
    }

    /// Seek to `low + i * stride` and keep the first message at or after it.
    async fn skip_scan<R: LogReader>(&self, run: &mut ScanRun<'_, R>, budget: &ScanBudget) -> ScanStop {
        let cursor = &mut run.cursor;
        cursor.stride = ((cursor.size() / run.target.limit) as i64).max(1);
        let mut empty_polls = 0;

        while cursor.collected < run.target.limit {
            if cursor.position >= cursor.high {
                return ScanStop::Exhausted;
            }
            if let Some(stop) = budget.checkpoint() {
                return stop;
            }

            if let Err(e) = run
                .reader
                .seek(run.topic, cursor.partition, Position::Offset(cursor.position))
                .await
            {
                run.error = Some(e.to_string());
                return ScanStop::ReadError;
            }

            run.polls += 1;
            let batch = match run.reader.poll(self.options.poll_timeout).await {
                Ok(batch) => batch,
                Err(e) => {
                    run.error = Some(e.to_string());
                    return ScanStop::ReadError;
                }
            };

            match batch.into_iter().find(|m| m.offset >= cursor.position) {
                Some(msg) if msg.offset < cursor.high => {
                    empty_polls = 0;
                    cursor.position = msg.offset + cursor.stride;
                    cursor.collected += 1;
                    run.samples.push(self.to_sample(msg).await);
                }
                Some(_) => return ScanStop::Exhausted,
                None => {
                    empty_polls += 1;
                    if empty_polls >= MAX_EMPTY_POLLS {
                        return ScanStop::Exhausted;
                    }
                }
            }
        }

        ScanStop::TargetReached
    }

    async fn to_sample(&self, msg: RawMessage) -> SampleRecord {
        SampleRecord {
            partition: msg.partition,
            offset: msg.offset,
            fields: self.decoder.decode(msg.payload.as_deref()).await,
            timestamp: msg.timestamp,
        }
    }

    /// Read from the reset position and keep one message per stride.
    async fn sequential_scan<R: LogReader>(
        &self,
        run: &mut ScanRun<'_, R>,
        budget: &ScanBudget,
    ) -> ScanStop {
        let policy = &self.policy;
        let cursor = &mut run.cursor;
        let limit = run.target.limit;

        let start = match policy.offset_reset {
            OffsetReset::Earliest => cursor.low,
            OffsetReset::Latest => (cursor.high - limit as i64).max(cursor.low),
        };
        cursor.position = start;
        cursor.stride = if policy.strategy == SamplingStrategy::TimeBased {
            1
        } else {
            (((cursor.high - start) as u64 / limit) as i64).max(1)
        };

        let cutoff = (policy.strategy == SamplingStrategy::TimeBased)
            .then(|| chrono::Duration::from_std(policy.sample_time_window).ok())
            .flatten()
            .map(|window| Utc::now() - window);

        if let Err(e) = run
            .reader
            .seek(run.topic, cursor.partition, Position::Offset(start))
            .await
        {
            run.error = Some(e.to_string());
            return ScanStop::ReadError;
        }

        let mut empty_polls = 0;
        loop {
            if policy.early_termination && cursor.collected >= limit {
                return ScanStop::TargetReached;
            }
            if cursor.position >= cursor.high {
                return if cursor.collected >= limit {
                    ScanStop::TargetReached
                } else {
                    ScanStop::Exhausted
                };
            }
            if let Some(stop) = budget.checkpoint() {
                return stop;
            }

            run.polls += 1;
            let batch = match run.reader.poll(self.options.poll_timeout).await {
                Ok(batch) => batch,
                Err(e) => {
                    run.error = Some(e.to_string());
                    return ScanStop::ReadError;
                }
            };

            if batch.is_empty() {
                empty_polls += 1;
                if empty_polls >= MAX_EMPTY_POLLS {
                    return ScanStop::Exhausted;
                }
                continue;
            }
            empty_polls = 0;

            for msg in batch {
                if msg.offset < cursor.position {
                    continue;
                }
                if msg.offset >= cursor.high {
                    cursor.position = cursor.high;
                    break;
                }
                cursor.position = msg.offset + 1;

                // Offsets may have gaps, so keep the first message at or
                // after the next planned offset rather than exact multiples.
                let planned = start + cursor.collected as i64 * cursor.stride;
                if cursor.collected >= limit || msg.offset < planned {
                    continue;
                }
                let in_window = match (cutoff, msg.timestamp) {
                    (Some(cutoff), Some(ts)) => ts >= cutoff,
                    _ => true,
                };
                if in_window {
                    cursor.collected += 1;
                    run.samples.push(self.to_sample(msg).await);
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::MemoryTransport;
    use serde_json::json;

    fn transport_with(partition_size: usize, batch_size: usize) -> Arc<MemoryTransport> {
        let transport = MemoryTransport::new().with_batch_size(batch_size);
        for i in 0..partition_size {
            transport.produce_json("t", 0, &json!({ "id": i, "email": format!("u{i}@x.io") }));
        }
        Arc::new(transport)
    }

    fn scanner(transport: &Arc<MemoryTransport>, policy: SamplingPolicy) -> PartitionScanner<MemoryTransport> {
        PartitionScanner::new(
            Arc::clone(transport),
            Arc::new(policy),
            ScanOptions {
                poll_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        )
    }

    fn count_policy(n: u64, skip: bool) -> SamplingPolicy {
        SamplingPolicy {
            strategy: SamplingStrategy::Count,
            max_samples_per_partition: n,
            min_samples_per_partition: 1,
            use_skip_based_sampling: skip,
            ..Default::default()
        }
    }

    #[test]
    fn test_child_flag_sees_parent() {
        let root = CancellationFlag::new();
        let child = root.child();
        let grandchild = child.child();

        child.cancel();
        assert!(grandchild.is_cancelled());
        assert!(!root.is_cancelled());

        let other = root.child();
        root.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn test_skip_scan_spaces_offsets_evenly() {
        let transport = transport_with(100, 50);
        let outcome = scanner(&transport, count_policy(10, true))
            .scan("t", 0, &ScanBudget::unbounded())
            .await;

        assert!(outcome.satisfied());
        assert_eq!(outcome.stop, ScanStop::TargetReached);
        let offsets: Vec<i64> = outcome.samples.samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90]);
        assert_eq!(outcome.polls, 10);
        assert_eq!(outcome.samples.samples[3].fields["id"], json!(30));
    }

    #[tokio::test]
    async fn test_sequential_scan_keeps_every_nth() {
        let transport = transport_with(100, 7);
        let outcome = scanner(&transport, count_policy(10, false))
            .scan("t", 0, &ScanBudget::unbounded())
            .await;

        assert!(outcome.satisfied());
        let offsets: Vec<i64> = outcome.samples.samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90]);
    }

    #[tokio::test]
    async fn test_offset_gaps_still_reach_target() {
        let transport = transport_with(2000, 100);
        transport.compact("t", 0, |offset| offset % 2 == 0);

        for skip in [false, true] {
            let outcome = scanner(&transport, count_policy(15, skip))
                .scan("t", 0, &ScanBudget::unbounded())
                .await;

            assert!(outcome.satisfied(), "skip={skip} stop={:?}", outcome.stop);
            assert_eq!(outcome.samples.len(), 15);
            assert_eq!(outcome.stop, ScanStop::TargetReached);
            assert!(outcome.samples.samples.iter().all(|s| s.offset % 2 == 0));
        }
    }

    #[tokio::test]
    async fn test_sequential_latest_reads_tail() {
        let transport = transport_with(100, 50);
        let mut policy = count_policy(5, false);
        policy.offset_reset = OffsetReset::Latest;

        let outcome = scanner(&transport, policy)
            .scan("t", 0, &ScanBudget::unbounded())
            .await;
        let offsets: Vec<i64> = outcome.samples.samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![95, 96, 97, 98, 99]);
    }

    #[tokio::test]
    async fn test_exhausted_partition_is_unsatisfied() {
        let transport = transport_with(4, 10);
        let outcome = scanner(&transport, count_policy(10, true))
            .scan("t", 0, &ScanBudget::unbounded())
            .await;

        assert!(!outcome.satisfied());
        assert_eq!(outcome.stop, ScanStop::Exhausted);
        assert_eq!(outcome.samples.len(), 4);
    }

    #[tokio::test]
    async fn test_empty_partition() {
        let transport = Arc::new(MemoryTransport::new());
        transport.create_topic("t", 1);
        let outcome = scanner(&transport, count_policy(10, true))
            .scan("t", 0, &ScanBudget::unbounded())
            .await;
        assert!(outcome.samples.is_empty());
        assert_eq!(outcome.polls, 0);
        assert_eq!(transport.readers_opened(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_read() {
        let transport = transport_with(100, 10);
        let cancel = CancellationFlag::new();
        cancel.cancel();

        let outcome = scanner(&transport, count_policy(10, true))
            .scan("t", 0, &ScanBudget::new(None, cancel))
            .await;
        assert_eq!(outcome.stop, ScanStop::Cancelled);
        assert_eq!(outcome.polls, 0);
        assert!(!outcome.satisfied());
    }

    #[tokio::test]
    async fn test_read_error_keeps_partial_samples() {
        let transport = transport_with(100, 100);
        transport.fail_polls_after(3, 1);

        let outcome = scanner(&transport, count_policy(10, true))
            .scan("t", 0, &ScanBudget::unbounded())
            .await;

        assert_eq!(outcome.stop, ScanStop::ReadError);
        assert!(!outcome.satisfied());
        assert!(outcome.samples.error.is_some());
        assert_eq!(outcome.samples.len(), 3);
        assert_eq!(outcome.polls, 4);
    }

    #[tokio::test]
    async fn test_time_based_skips_old_messages() {
        let transport = MemoryTransport::new().with_batch_size(50);
        let old = Utc::now() - chrono::Duration::hours(2);
        for i in 0..10 {
            transport.produce_at("t", 0, json!({ "id": i }).to_string(), old);
        }
        for i in 10..20 {
            transport.produce_json("t", 0, &json!({ "id": i }));
        }
        let transport = Arc::new(transport);

        let policy = SamplingPolicy {
            strategy: SamplingStrategy::TimeBased,
            min_samples_per_partition: 5,
            max_samples_per_partition: 8,
            sample_time_window: Duration::from_secs(3600),
            ..Default::default()
        };
        let outcome = scanner(&transport, policy)
            .scan("t", 0, &ScanBudget::unbounded())
            .await;

        assert!(outcome.satisfied());
        assert_eq!(outcome.samples.len(), 8);
        assert_eq!(outcome.stop, ScanStop::TargetReached);
        assert!(outcome.samples.samples.iter().all(|s| s.offset >= 10));
    }
}
