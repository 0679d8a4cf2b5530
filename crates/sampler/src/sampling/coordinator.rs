//! Topic-level fan-out of partition scans.

use super::decode::PayloadDecoder;
use super::scanner::{CancellationFlag, PartitionScanner, ScanBudget, ScanOptions, ScanOutcome, ScanStop};
use crate::kafka::{KafkaError, LogTransport};
use pii_sampler_types::{PartitionSamples, SamplingPolicy, TopicSampleResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Limits for one topic's scans.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Concurrent partition scans per topic
    pub max_parallel_partitions: usize,
    /// Wall-clock limit for each partition scan
    pub partition_timeout: Option<Duration>,
    pub scan: ScanOptions,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            max_parallel_partitions: 30,
            partition_timeout: Some(Duration::from_secs(60)),
            scan: ScanOptions::default(),
        }
    }
}

/// Samples whole topics by running one [`PartitionScanner`] per partition.
///
/// With `max_partitions_per_topic = K`, partitions are counted as their
/// scans complete satisfied. The K-th satisfied completion cancels every
/// scan still running. The cap is exact: a satisfied result that arrives
/// after the cap was reached is dropped, while unsatisfied partial results
/// of cancelled scans are kept.
pub struct SamplingCoordinator<T: LogTransport> {
    transport: Arc<T>,
    scanner: PartitionScanner<T>,
    policy: Arc<SamplingPolicy>,
    options: CoordinatorOptions,
}

impl<T: LogTransport> SamplingCoordinator<T> {
    pub fn new(transport: Arc<T>, policy: SamplingPolicy, options: CoordinatorOptions) -> Self {
        let policy = Arc::new(policy);
        let scanner = PartitionScanner::new(
            Arc::clone(&transport),
            Arc::clone(&policy),
            options.scan.clone(),
        );
        Self {
            transport,
            scanner,
            policy,
            options,
        }
    }

    /// Decode sampled payloads with `decoder`, e.g. one backed by a schema registry.
    pub fn with_decoder(mut self, decoder: PayloadDecoder) -> Self {
        self.scanner = self.scanner.with_decoder(decoder);
        self
    }

    pub fn policy(&self) -> &SamplingPolicy {
        &self.policy
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Sample every partition of `topic`.
    pub async fn sample_topic(&self, topic: &str) -> Result<TopicSampleResult, KafkaError> {
        self.sample_topic_with_cancel(topic, &CancellationFlag::new())
            .await
    }

    /// Sample `topic`, stopping early when `cancel` fires.
    ///
    /// Only partition discovery can fail. A topic without partitions yields
    /// an empty result.
    pub async fn sample_topic_with_cancel(
        &self,
        topic: &str,
        cancel: &CancellationFlag,
    ) -> Result<TopicSampleResult, KafkaError> {
        let started = Instant::now();
        let partitions = self.transport.list_partitions(topic).await?;
        if partitions.is_empty() {
            info!(topic, "Topic has no partitions, nothing to sample");
            return Ok(TopicSampleResult::empty(topic, started.elapsed()));
        }

        let topic_cancel = cancel.child();
        let cap = self.policy.max_partitions_per_topic;
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallel_partitions.max(1)));
        let mut scans: JoinSet<(usize, Option<ScanOutcome>)> = JoinSet::new();

        for (index, partition) in partitions.iter().copied().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let scanner = self.scanner.clone();
            let budget = ScanBudget::new(self.options.partition_timeout, topic_cancel.clone());
            let topic = topic.to_string();

            scans.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, None);
                };
                if budget.cancel.is_cancelled() {
                    return (index, None);
                }
                (index, Some(scanner.scan(&topic, partition, &budget).await))
            });
        }

        let mut collected: Vec<(usize, PartitionSamples)> = Vec::with_capacity(partitions.len());
        let mut satisfied = 0usize;

        while let Some(joined) = scans.join_next().await {
            let (index, outcome) = match joined {
                Ok((index, Some(outcome))) => (index, outcome),
                Ok((_, None)) => continue,
                Err(e) => {
                    warn!(topic, error = %e, "Partition scan task failed");
                    continue;
                }
            };

            let cap_reached = cap.is_some_and(|k| satisfied >= k);
            if outcome.satisfied() {
                if cap_reached {
                    debug!(topic, partition = outcome.samples.partition, "Dropping satisfied partition past the cap");
                    continue;
                }
                satisfied += 1;
                if cap.is_some_and(|k| satisfied >= k) {
                    info!(topic, satisfied, "Partition cap reached, cancelling remaining scans");
                    topic_cancel.cancel();
                }
            } else if outcome.stop == ScanStop::Cancelled && outcome.samples.is_empty() {
                continue;
            }

            collected.push((index, outcome.samples));
        }

        collected.sort_by_key(|(index, _)| *index);
        let result = TopicSampleResult {
            topic: topic.to_string(),
            partitions: collected.into_iter().map(|(_, samples)| samples).collect(),
            satisfied_partitions: satisfied,
            duration: started.elapsed(),
        };

        info!(
            topic,
            partitions = partitions.len(),
            sampled = result.partitions.len(),
            satisfied = result.satisfied_partitions,
            samples = result.total_samples(),
            duration_ms = result.duration.as_millis() as u64,
            "Topic sampling complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::MemoryTransport;
    use pii_sampler_types::SamplingStrategy;
    use serde_json::json;

    fn topic(partitions: i32, per_partition: usize) -> Arc<MemoryTransport> {
        let transport = MemoryTransport::new().with_batch_size(50);
        for p in 0..partitions {
            for i in 0..per_partition {
                transport.produce_json("users", p, &json!({ "p": p, "i": i }));
            }
        }
        Arc::new(transport)
    }

    fn options(parallel: usize) -> CoordinatorOptions {
        CoordinatorOptions {
            max_parallel_partitions: parallel,
            partition_timeout: None,
            scan: ScanOptions {
                poll_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_missing_topic_is_empty() {
        let coordinator = SamplingCoordinator::new(
            Arc::new(MemoryTransport::new()),
            SamplingPolicy::default(),
            options(4),
        );
        let result = coordinator.sample_topic("ghost").await.unwrap();
        assert!(result.partitions.is_empty());
        assert_eq!(result.satisfied_partitions, 0);
    }

    #[tokio::test]
    async fn test_results_follow_discovery_order() {
        let coordinator = SamplingCoordinator::new(
            topic(5, 40),
            SamplingPolicy {
                strategy: SamplingStrategy::Count,
                max_samples_per_partition: 4,
                min_samples_per_partition: 1,
                ..Default::default()
            },
            options(5),
        );
        let result = coordinator.sample_topic("users").await.unwrap();
        let order: Vec<i32> = result.partitions.iter().map(|p| p.partition).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(result.satisfied_partitions, 5);
        assert_eq!(result.total_samples(), 20);
    }

    #[tokio::test]
    async fn test_serial_partition_cap() {
        let transport = topic(4, 100);
        let coordinator = SamplingCoordinator::new(
            Arc::clone(&transport),
            SamplingPolicy {
                strategy: SamplingStrategy::Count,
                max_samples_per_partition: 5,
                min_samples_per_partition: 1,
                max_partitions_per_topic: Some(2),
                ..Default::default()
            },
            options(1),
        );

        let result = coordinator.sample_topic("users").await.unwrap();
        assert_eq!(result.satisfied_partitions, 2);
        assert_eq!(result.partitions.len(), 2);
        assert!(transport.readers_opened() <= 4);
    }

    #[tokio::test]
    async fn test_parallel_partition_cap_is_exact() {
        let coordinator = SamplingCoordinator::new(
            topic(6, 200),
            SamplingPolicy {
                strategy: SamplingStrategy::Count,
                max_samples_per_partition: 20,
                min_samples_per_partition: 1,
                max_partitions_per_topic: Some(3),
                ..Default::default()
            },
            options(6),
        );

        let result = coordinator.sample_topic("users").await.unwrap();
        assert_eq!(result.satisfied_partitions, 3);
        assert_eq!(result.partitions.iter().filter(|p| p.satisfied).count(), 3);
        for partition in result.partitions.iter().filter(|p| p.satisfied) {
            assert_eq!(partition.len(), 20);
        }
    }

    #[tokio::test]
    async fn test_external_cancel_returns_partial_results() {
        let transport = topic(2, 1000);
        transport.set_poll_latency(Duration::from_millis(5));
        let coordinator = Arc::new(SamplingCoordinator::new(
            Arc::clone(&transport),
            SamplingPolicy {
                strategy: SamplingStrategy::Count,
                max_samples_per_partition: 500,
                min_samples_per_partition: 500,
                ..Default::default()
            },
            options(2),
        ));

        let cancel = CancellationFlag::new();
        let task = {
            let coordinator = Arc::clone(&coordinator);
            let cancel = cancel.clone();
            tokio::spawn(async move { coordinator.sample_topic_with_cancel("users", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.satisfied_partitions, 0);
        assert!(result.total_samples() > 0);
        assert!(result.partitions.iter().all(|p| !p.satisfied));
    }
}
