//! Batch mode: sample, classify and tag a set of topics.

use super::coordinator::SamplingCoordinator;
use super::scanner::CancellationFlag;
use crate::classification::{Classifier, FieldClassifier};
use crate::error::Result;
use crate::kafka::LogTransport;
use crate::kafka::config::duration_millis;
use crate::schema::SchemaTagger;
use futures::stream::{self, StreamExt};
use pii_sampler_types::{ClassificationInput, FieldClassification};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Outcome for one sampled topic
#[derive(Debug, Clone, Serialize)]
pub struct TopicReport {
    pub topic: String,
    pub partitions: usize,
    pub satisfied_partitions: usize,
    pub samples: usize,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Fields judged to hold PII
    pub fields: Vec<FieldClassification>,
    /// Schema id registered by tagging, if any
    pub schema_id: Option<u32>,
    pub tagging_error: Option<String>,
}

impl TopicReport {
    pub fn has_pii(&self) -> bool {
        !self.fields.is_empty()
    }
}

/// A topic that could not be sampled
#[derive(Debug, Clone, Serialize)]
pub struct TopicFailure {
    pub topic: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    /// Sampled topics in request order
    pub topics: Vec<TopicReport>,
    pub failures: Vec<TopicFailure>,
    /// Topics not started before cancellation
    pub skipped: Vec<String>,
    pub cancelled: bool,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl BatchReport {
    pub fn total_samples(&self) -> usize {
        self.topics.iter().map(|t| t.samples).sum()
    }

    pub fn pii_topics(&self) -> impl Iterator<Item = &TopicReport> {
        self.topics.iter().filter(|t| t.has_pii())
    }
}

enum TopicOutcome {
    Sampled(TopicReport),
    Failed(TopicFailure),
    Skipped(String),
}

/// Runs the [`SamplingCoordinator`] over many topics.
///
/// At most `parallel_workers` topics are in flight; each of them fans out
/// into at most `max_parallel_partitions` partition scans.
pub struct BatchSampler<T: LogTransport> {
    coordinator: SamplingCoordinator<T>,
    parallel_workers: usize,
    classifier: Arc<dyn Classifier>,
    judge: FieldClassifier,
    tagger: Option<SchemaTagger>,
}

impl<T: LogTransport> BatchSampler<T> {
    pub fn new(
        coordinator: SamplingCoordinator<T>,
        parallel_workers: usize,
        classifier: Arc<dyn Classifier>,
        judge: FieldClassifier,
    ) -> Self {
        Self {
            coordinator,
            parallel_workers: parallel_workers.max(1),
            classifier,
            judge,
            tagger: None,
        }
    }

    pub fn with_tagger(mut self, tagger: SchemaTagger) -> Self {
        self.tagger = Some(tagger);
        self
    }

    /// Topics to sample: `requested`, or every non-internal topic when empty.
    pub async fn resolve_topics(&self, requested: &[String]) -> Result<Vec<String>> {
        if !requested.is_empty() {
            return Ok(requested.to_vec());
        }
        let mut topics: Vec<String> = self
            .coordinator
            .transport()
            .list_topics()
            .await?
            .into_iter()
            .filter(|t| !t.starts_with("__"))
            .collect();
        topics.sort();
        Ok(topics)
    }

    /// Sample every topic in `topics` (all topics when empty).
    ///
    /// Only topic listing can fail; per-topic errors land in
    /// [`BatchReport::failures`].
    pub async fn run(&self, topics: &[String], cancel: &CancellationFlag) -> Result<BatchReport> {
        let started = Instant::now();
        let topics = self.resolve_topics(topics).await?;
        info!(
            topics = topics.len(),
            parallel_workers = self.parallel_workers,
            strategy = self.coordinator.policy().strategy.as_str(),
            "Starting batch sampling"
        );

        let mut outcomes: Vec<(usize, TopicOutcome)> = stream::iter(topics.into_iter().enumerate())
            .map(|(index, topic)| async move { (index, self.process_topic(topic, cancel).await) })
            .buffer_unordered(self.parallel_workers)
            .collect()
            .await;
        outcomes.sort_by_key(|(index, _)| *index);

        let mut report = BatchReport {
            cancelled: cancel.is_cancelled(),
            ..BatchReport::default()
        };
        for (_, outcome) in outcomes {
            match outcome {
                TopicOutcome::Sampled(topic) => report.topics.push(topic),
                TopicOutcome::Failed(failure) => report.failures.push(failure),
                TopicOutcome::Skipped(topic) => report.skipped.push(topic),
            }
        }
        report.duration = started.elapsed();

        info!(
            sampled = report.topics.len(),
            failed = report.failures.len(),
            skipped = report.skipped.len(),
            samples = report.total_samples(),
            duration_ms = report.duration.as_millis() as u64,
            "Batch sampling finished"
        );
        Ok(report)
    }

    async fn process_topic(&self, topic: String, cancel: &CancellationFlag) -> TopicOutcome {
        if cancel.is_cancelled() {
            return TopicOutcome::Skipped(topic);
        }

        let result = match self
            .coordinator
            .sample_topic_with_cancel(&topic, &cancel.child())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Topic sampling failed");
                return TopicOutcome::Failed(TopicFailure {
                    topic,
                    error: e.to_string(),
                });
            }
        };

        let input = ClassificationInput::from_result(&result);
        let fields = if input.is_empty() {
            Vec::new()
        } else {
            self.judge.classify(self.classifier.as_ref(), &input)
        };

        let mut report = TopicReport {
            topic,
            partitions: result.partitions.len(),
            satisfied_partitions: result.satisfied_partitions,
            samples: result.total_samples(),
            duration: result.duration,
            fields,
            schema_id: None,
            tagging_error: None,
        };

        if let Some(tagger) = &self.tagger {
            if report.has_pii() {
                match tagger.tag_topic(&report.topic, &report.fields).await {
                    Ok(id) => report.schema_id = id,
                    Err(e) => {
                        warn!(topic = %report.topic, error = %e, "Schema tagging failed");
                        report.tagging_error = Some(e.to_string());
                    }
                }
            }
        }

        if report.has_pii() {
            info!(
                topic = %report.topic,
                fields = report.fields.len(),
                samples = report.samples,
                "PII fields found"
            );
        }
        TopicOutcome::Sampled(report)
    }
}
