//! The long-lived poll, handle, commit loop.

use super::handler::RecordHandler;
use crate::error::{Result, SamplerError};
use crate::kafka::config::duration_millis;
use crate::kafka::{
    KafkaError, LogReader, LogTransport, OffsetManager, OffsetStats, OffsetStore, Position,
    RawMessage, TopicPartition,
};
use crate::resilience::{BreakerConfig, BreakerStats, ConnectionBreaker, FailureOutcome, Gate};
use crate::sampling::CancellationFlag;
use pii_sampler_types::OffsetReset;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Granularity of interruptible waits
const SHUTDOWN_CHECK: Duration = Duration::from_millis(50);

/// Streaming mode settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_offset_file")]
    pub offset_file: PathBuf,

    /// Processed records between commits
    #[serde(default = "default_commit_interval")]
    pub commit_interval: u64,

    #[serde(default = "default_poll_timeout", with = "duration_millis")]
    pub poll_timeout: Duration,

    /// Start position when no durable offset exists
    #[serde(default = "default_offset_reset")]
    pub offset_reset: OffsetReset,

    #[serde(default)]
    pub terminate_on_circuit_open: bool,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_backoff_base", with = "duration_millis")]
    pub backoff_base: Duration,

    #[serde(default = "default_backoff_max", with = "duration_millis")]
    pub backoff_max: Duration,

    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
}

fn default_offset_file() -> PathBuf {
    PathBuf::from("streaming_offsets.json")
}

fn default_commit_interval() -> u64 {
    100
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_offset_reset() -> OffsetReset {
    OffsetReset::Latest
}

fn default_failure_threshold() -> u32 {
    100
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_jitter() -> f64 {
    0.2
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            offset_file: default_offset_file(),
            commit_interval: default_commit_interval(),
            poll_timeout: default_poll_timeout(),
            offset_reset: default_offset_reset(),
            terminate_on_circuit_open: false,
            failure_threshold: default_failure_threshold(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            backoff_jitter: default_backoff_jitter(),
        }
    }
}

impl StreamingConfig {
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            base_delay: self.backoff_base,
            max_delay: self.backoff_max,
            jitter: self.backoff_jitter,
            terminate_on_open: self.terminate_on_circuit_open,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.commit_interval == 0 {
            return Err("commit_interval must be greater than 0".to_string());
        }
        if self.poll_timeout.is_zero() {
            return Err("poll_timeout must be greater than 0".to_string());
        }
        if self.offset_file.as_os_str().is_empty() {
            return Err("offset_file must not be empty".to_string());
        }
        self.breaker().validate()
    }
}

/// Session counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub processed: u64,
    pub polls: u64,
    pub empty_polls: u64,
    pub handler_failures: u64,
    pub consecutive_handler_failures: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub connection_failures: u64,
    pub reconnects: u64,
    pub circuit_opens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Stopped by the shutdown signal
    Shutdown,
    /// The circuit opened with `terminate_on_circuit_open` set
    CircuitOpen,
}

/// Summary returned when a session ends
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub topics: Vec<String>,
    pub termination: TerminationReason,
    pub stats: SessionStats,
    pub offsets: OffsetStats,
    pub breaker: BreakerStats,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl SessionReport {
    /// Turn a circuit-open termination into an error.
    pub fn into_result(self) -> Result<Self> {
        match self.termination {
            TerminationReason::Shutdown => Ok(self),
            TerminationReason::CircuitOpen => Err(SamplerError::CircuitOpen {
                consecutive_failures: self.breaker.consecutive_failures,
            }),
        }
    }
}

/// Continuous consumption of a fixed topic set with resumable offsets.
///
/// Single task: one poll, handle, commit loop. Connection-level failures
/// (connect, poll, commit) drive the [`ConnectionBreaker`]; handler
/// failures are only counted.
pub struct StreamingSession<T: LogTransport, S: OffsetStore> {
    transport: Arc<T>,
    topics: Vec<String>,
    group_id: String,
    config: StreamingConfig,
    handler: Arc<dyn RecordHandler>,
    offsets: OffsetManager<S>,
    breaker: ConnectionBreaker,
    stats: SessionStats,
}

impl<T: LogTransport, S: OffsetStore> StreamingSession<T, S> {
    pub fn new(
        transport: Arc<T>,
        store: Arc<S>,
        topics: Vec<String>,
        group_id: impl Into<String>,
        config: StreamingConfig,
        handler: Arc<dyn RecordHandler>,
    ) -> Self {
        let offsets = OffsetManager::new(store, config.commit_interval);
        let breaker = ConnectionBreaker::new(config.breaker());
        Self {
            transport,
            topics,
            group_id: group_id.into(),
            config,
            handler,
            offsets,
            breaker,
            stats: SessionStats::default(),
        }
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn breaker(&self) -> &ConnectionBreaker {
        &self.breaker
    }

    pub fn offsets(&self) -> &OffsetManager<S> {
        &self.offsets
    }

    /// Consume until `shutdown` is cancelled or the circuit opens fatally.
    pub async fn run(&mut self, shutdown: CancellationFlag) -> Result<SessionReport> {
        if self.topics.is_empty() {
            return Err(SamplerError::Configuration(
                "streaming session needs at least one topic".to_string(),
            ));
        }

        let started = Instant::now();
        info!(
            topics = ?self.topics,
            group_id = %self.group_id,
            commit_interval = self.config.commit_interval,
            "Starting streaming session"
        );

        self.offsets.restore(&self.topics).await;

        let mut reader: Option<T::Reader> = None;
        let termination = loop {
            if shutdown.is_cancelled() {
                break TerminationReason::Shutdown;
            }

            let trial = match self.breaker.check() {
                Gate::Proceed => false,
                Gate::Trial => true,
                Gate::Wait(remaining) => {
                    debug!(?remaining, "Circuit open, not polling");
                    pause(remaining, &shutdown).await;
                    continue;
                }
            };

            if trial && reader.take().is_some() {
                debug!("Dropping connection before trial reconnect");
            }

            if reader.is_none() {
                match self.connect(trial).await {
                    Ok(fresh) => reader = Some(fresh),
                    Err(e) => {
                        if self.on_connection_failure(e, &shutdown).await {
                            break TerminationReason::CircuitOpen;
                        }
                        continue;
                    }
                }
            }
            let Some(current) = reader.as_mut() else {
                continue;
            };

            if let Err(e) = self.poll_once(current).await {
                let fatal = self.on_connection_failure(e, &shutdown).await;
                // an open circuit releases the connection; the trial reconnects
                if !self.breaker.state().is_closed() {
                    reader = None;
                }
                if fatal {
                    break TerminationReason::CircuitOpen;
                }
            }
        };

        if let Some(current) = reader.as_mut() {
            self.final_commit(current).await;
        } else if self.offsets.has_pending() {
            warn!(
                pending = self.offsets.since_commit(),
                "No connection at shutdown, pending offsets not committed"
            );
        }

        let report = SessionReport {
            topics: self.topics.clone(),
            termination,
            stats: self.stats.clone(),
            offsets: self.offsets.stats().clone(),
            breaker: self.breaker.stats(),
            duration: started.elapsed(),
        };
        info!(
            termination = ?report.termination,
            processed = report.stats.processed,
            commits = report.stats.commits,
            "Streaming session stopped"
        );
        Ok(report)
    }

    /// Open a connection positioned at the resume point.
    ///
    /// Durable and in-flight offsets win over the group's broker offsets;
    /// partitions without one start at the reset policy.
    async fn connect(&mut self, trial: bool) -> std::result::Result<T::Reader, KafkaError> {
        if trial {
            self.stats.reconnects += 1;
        }
        let mut reader = self.transport.open_reader(&self.group_id).await?;

        let resume = self.resume_positions();
        if resume.is_empty() {
            reader.subscribe(&self.topics, self.config.offset_reset).await?;
            debug!(topics = ?self.topics, reset = self.config.offset_reset.as_str(), "Subscribed");
            return Ok(reader);
        }

        for topic in &self.topics {
            for partition in self.transport.list_partitions(topic).await? {
                let tp = TopicPartition::new(topic.clone(), partition);
                let position = resume
                    .get(&tp)
                    .map(|offset| Position::Offset(*offset))
                    .unwrap_or_else(|| self.config.offset_reset.into());
                reader.seek(topic, partition, position).await?;
                debug!(partition = %tp, ?position, "Resuming partition");
            }
        }
        Ok(reader)
    }

    fn resume_positions(&self) -> HashMap<TopicPartition, i64> {
        let mut positions: HashMap<TopicPartition, i64> = self
            .offsets
            .committed()
            .iter()
            .filter(|(tp, _)| self.topics.contains(&tp.topic))
            .map(|(tp, entry)| (tp.clone(), entry.offset))
            .collect();
        for (tp, next) in self.offsets.pending_offsets() {
            positions
                .entry(tp)
                .and_modify(|current| *current = (*current).max(next))
                .or_insert(next);
        }
        positions
    }

    /// One poll, then hand every record over and commit on cadence.
    async fn poll_once(&mut self, reader: &mut T::Reader) -> std::result::Result<(), KafkaError> {
        let batch = reader.poll(self.config.poll_timeout).await?;
        self.breaker.record_success();
        self.stats.polls += 1;

        if batch.is_empty() {
            self.stats.empty_polls += 1;
            // retry a commit that failed mid-batch
            if self.offsets.should_commit() {
                self.commit(reader).await?;
            }
            return Ok(());
        }

        // the reader has already moved past the batch, so a failed commit
        // must not drop the records after it
        let mut commit_error = None;
        for message in &batch {
            self.dispatch(message).await;
            self.offsets
                .track(&message.topic, message.partition, message.offset);
            if commit_error.is_none() && self.offsets.should_commit() {
                commit_error = self.commit(reader).await.err();
            }
        }
        match commit_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn dispatch(&mut self, message: &RawMessage) {
        self.stats.processed += 1;
        let result = self.handler.handle(message).await;
        match result {
            Ok(()) => self.stats.consecutive_handler_failures = 0,
            Err(e) => {
                self.stats.handler_failures += 1;
                self.stats.consecutive_handler_failures += 1;
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    consecutive = self.stats.consecutive_handler_failures,
                    error = %e,
                    "Record handler failed"
                );
            }
        }
    }

    /// Commit pending offsets to the broker, then persist them.
    async fn commit(&mut self, reader: &mut T::Reader) -> std::result::Result<(), KafkaError> {
        let pending = self.offsets.pending_offsets();
        if pending.is_empty() {
            return Ok(());
        }

        if let Err(e) = reader.commit(&pending).await {
            self.offsets.record_commit_failure();
            self.stats.commit_failures += 1;
            return Err(e);
        }

        self.offsets.mark_committed();
        self.stats.commits += 1;
        debug!(partitions = pending.len(), "Committed offsets");

        if let Err(e) = self.offsets.persist().await {
            warn!(error = %e, "Failed to persist committed offsets");
        }
        Ok(())
    }

    async fn final_commit(&mut self, reader: &mut T::Reader) {
        if !self.offsets.has_pending() {
            return;
        }
        match self.commit(reader).await {
            Ok(()) => info!("Committed pending offsets on shutdown"),
            Err(e) => error!(error = %e, "Final offset commit failed"),
        }
    }

    /// Report a connection-level failure. Returns true when the session
    /// must terminate.
    async fn on_connection_failure(&mut self, e: KafkaError, shutdown: &CancellationFlag) -> bool {
        self.stats.connection_failures += 1;
        if e.is_fatal() {
            error!(error = %e, "Broker rejected credentials or configuration");
        }
        match self.breaker.record_failure() {
            FailureOutcome::Retry(delay) => {
                warn!(
                    error = %e,
                    consecutive = self.breaker.consecutive_failures(),
                    "Connection failure, retrying"
                );
                pause(delay, shutdown).await;
                false
            }
            FailureOutcome::Opened(delay) => {
                self.stats.circuit_opens += 1;
                warn!(error = %e, ?delay, "Circuit opened, backing off");
                false
            }
            FailureOutcome::Fatal => {
                self.stats.circuit_opens += 1;
                error!(
                    error = %e,
                    consecutive = self.breaker.consecutive_failures(),
                    "Circuit opened, terminating streaming session"
                );
                true
            }
        }
    }
}

/// Sleep for `duration` unless `shutdown` fires first.
async fn pause(duration: Duration, shutdown: &CancellationFlag) {
    let deadline = tokio::time::Instant::now() + duration;
    while !shutdown.is_cancelled() {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep((deadline - now).min(SHUTDOWN_CHECK)).await;
    }
}
