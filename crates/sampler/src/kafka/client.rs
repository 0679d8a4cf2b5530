//! rdkafka-backed implementation of the transport traits.

use super::config::KafkaClientConfig;
use super::error::{KafkaError, Result};
use super::transport::{LogReader, LogTransport, Position, RawMessage, TopicPartition};
use async_trait::async_trait;
use chrono::DateTime;
use futures::FutureExt;
use pii_sampler_types::OffsetReset;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, DefaultConsumerContext, Rebalance,
    StreamConsumer,
};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Upper bound on messages drained from the local queue per poll.
const MAX_POLL_RECORDS: usize = 500;

const METADATA_GROUP: &str = "pii-sampler-metadata";

/// Cluster access through a long-lived metadata consumer.
pub struct KafkaTransport {
    config: KafkaClientConfig,
    metadata: Arc<BaseConsumer<DefaultConsumerContext>>,
}

impl KafkaTransport {
    pub fn new(config: KafkaClientConfig) -> Result<Self> {
        config
            .validate()
            .map_err(KafkaError::InvalidConfiguration)?;

        let metadata: BaseConsumer<DefaultConsumerContext> =
            client_config(&config, METADATA_GROUP)
                .create()
                .map_err(|e| KafkaError::connection(e.to_string(), &config.bootstrap_servers))?;

        Ok(Self {
            config,
            metadata: Arc::new(metadata),
        })
    }

    pub fn config(&self) -> &KafkaClientConfig {
        &self.config
    }

    async fn fetch_partitions(&self, topic: Option<String>) -> Result<Vec<(String, Vec<i32>)>> {
        let consumer = Arc::clone(&self.metadata);
        let timeout = self.config.request_timeout;
        let broker = self.config.bootstrap_servers.clone();

        tokio::task::spawn_blocking(move || {
            let metadata = consumer
                .fetch_metadata(topic.as_deref(), timeout)
                .map_err(|e| match e {
                    rdkafka::error::KafkaError::MetadataFetch(
                        RDKafkaErrorCode::BrokerTransportFailure
                        | RDKafkaErrorCode::AllBrokersDown
                        | RDKafkaErrorCode::OperationTimedOut,
                    ) => KafkaError::connection(e.to_string(), broker.clone()),
                    other => KafkaError::topic_metadata(
                        other.to_string(),
                        topic.clone().unwrap_or_default(),
                    ),
                })?;

            Ok(metadata
                .topics()
                .iter()
                .filter(|t| t.error().is_none())
                .map(|t| {
                    let mut ids: Vec<i32> = t.partitions().iter().map(|p| p.id()).collect();
                    ids.sort_unstable();
                    (t.name().to_string(), ids)
                })
                .collect())
        })
        .await
        .map_err(|e| KafkaError::Other(format!("metadata task failed: {e}")))?
    }
}

#[async_trait]
impl LogTransport for KafkaTransport {
    type Reader = KafkaReader;

    async fn list_topics(&self) -> Result<Vec<String>> {
        let topics = self.fetch_partitions(None).await?;
        Ok(topics.into_iter().map(|(name, _)| name).collect())
    }

    async fn list_partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let topics = self.fetch_partitions(Some(topic.to_string())).await?;
        Ok(topics
            .into_iter()
            .find(|(name, _)| name == topic)
            .map(|(_, ids)| ids)
            .unwrap_or_default())
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        let consumer = Arc::clone(&self.metadata);
        let timeout = self.config.request_timeout;
        let topic = topic.to_string();

        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_watermarks(&topic, partition, timeout)
                .map_err(|e| match e.rdkafka_error_code() {
                    Some(RDKafkaErrorCode::UnknownPartition)
                    | Some(RDKafkaErrorCode::UnknownTopicOrPartition) => {
                        KafkaError::partition_not_found(topic.clone(), partition)
                    }
                    _ => KafkaError::consumption(e.to_string(), topic.clone(), Some(partition)),
                })
        })
        .await
        .map_err(|e| KafkaError::Other(format!("watermark task failed: {e}")))?
    }

    async fn open_reader(&self, group_id: &str) -> Result<KafkaReader> {
        KafkaReader::new(&self.config, group_id)
    }
}

fn client_config(config: &KafkaClientConfig, group_id: &str) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    for (key, value) in config.to_rdkafka_properties(group_id) {
        client_config.set(key, value);
    }
    client_config
}

/// Logs group rebalances and commit outcomes.
pub struct ReaderContext {
    group_id: String,
}

impl ClientContext for ReaderContext {}

impl ConsumerContext for ReaderContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(group_id = %self.group_id, partitions = tpl.count(), "Partitions revoked")
            }
            Rebalance::Assign(tpl) => {
                info!(group_id = %self.group_id, partitions = tpl.count(), "Partitions assigned")
            }
            Rebalance::Error(err) => error!(group_id = %self.group_id, "Rebalance error: {}", err),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(err) = result {
            error!(group_id = %self.group_id, "Commit callback error: {}", err);
        }
    }
}

/// One consumer connection. Used either in group mode (`subscribe`) or
/// with a manual assignment built up by `seek`.
pub struct KafkaReader {
    consumer: StreamConsumer<ReaderContext>,
    config: KafkaClientConfig,
    assignment: TopicPartitionList,
    subscribed: bool,
    group_id: String,
}

impl KafkaReader {
    fn new(config: &KafkaClientConfig, group_id: &str) -> Result<Self> {
        Ok(Self {
            consumer: Self::create_consumer(config, group_id, None)?,
            config: config.clone(),
            assignment: TopicPartitionList::new(),
            subscribed: false,
            group_id: group_id.to_string(),
        })
    }

    fn create_consumer(
        config: &KafkaClientConfig,
        group_id: &str,
        reset: Option<OffsetReset>,
    ) -> Result<StreamConsumer<ReaderContext>> {
        let mut client_config = client_config(config, group_id);
        if let Some(reset) = reset {
            client_config.set("auto.offset.reset", reset.as_str());
        }

        let context = ReaderContext {
            group_id: group_id.to_string(),
        };
        client_config
            .create_with_context(context)
            .map_err(|e| KafkaError::connection(e.to_string(), &config.bootstrap_servers))
    }

    fn to_raw(msg: &BorrowedMessage<'_>) -> RawMessage {
        RawMessage {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|p| p.to_vec()),
            timestamp: msg
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
        }
    }
}

fn to_offset(position: Position) -> Offset {
    match position {
        Position::Offset(offset) => Offset::Offset(offset),
        Position::Earliest => Offset::Beginning,
        Position::Latest => Offset::End,
    }
}

#[async_trait]
impl LogReader for KafkaReader {
    async fn subscribe(&mut self, topics: &[String], reset: OffsetReset) -> Result<()> {
        // auto.offset.reset is fixed at client creation.
        self.consumer = Self::create_consumer(&self.config, &self.group_id, Some(reset))?;
        self.assignment = TopicPartitionList::new();

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topic_refs)
            .map_err(|e| KafkaError::consumption(e.to_string(), topics.join(","), None))?;
        self.subscribed = true;

        info!(group_id = %self.group_id, ?topics, reset = reset.as_str(), "Subscribed to topics");
        Ok(())
    }

    async fn seek(&mut self, topic: &str, partition: i32, position: Position) -> Result<()> {
        let offset = to_offset(position);

        if self.subscribed {
            return self
                .consumer
                .seek(topic, partition, offset, Duration::from_secs(10))
                .map_err(|e| {
                    KafkaError::consumption(e.to_string(), topic, Some(partition))
                });
        }

        let result = if self.assignment.find_partition(topic, partition).is_some() {
            self.assignment.set_partition_offset(topic, partition, offset)
        } else {
            self.assignment.add_partition_offset(topic, partition, offset)
        };
        result.map_err(|e| KafkaError::consumption(e.to_string(), topic, Some(partition)))?;

        self.consumer
            .assign(&self.assignment)
            .map_err(|e| KafkaError::consumption(e.to_string(), topic, Some(partition)))?;

        debug!(topic, partition, ?position, "Assigned partition");
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<RawMessage>> {
        let first = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(result) => result?,
        };

        let mut batch = vec![Self::to_raw(&first)];

        while batch.len() < MAX_POLL_RECORDS {
            match self.consumer.recv().now_or_never() {
                Some(Ok(msg)) => batch.push(Self::to_raw(&msg)),
                Some(Err(e)) => {
                    debug!(error = %e, "Stopping batch drain on consumer error");
                    break;
                }
                None => break,
            }
        }

        Ok(batch)
    }

    async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::with_capacity(offsets.len());
        for (tp, next) in offsets {
            tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*next))
                .map_err(|e| KafkaError::offset_commit(e.to_string(), &self.group_id))?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| KafkaError::offset_commit(e.to_string(), &self.group_id))
    }
}
