//! Per-record handlers for the streaming session

use crate::classification::{Classifier, ClassifierConfig, FieldClassifier};
use crate::error::Result;
use crate::kafka::RawMessage;
use crate::sampling::PayloadDecoder;
use crate::schema::SchemaTagger;
use async_trait::async_trait;
use dashmap::DashMap;
use pii_sampler_types::{ClassificationInput, FieldClassification};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Receives every record consumed by a streaming session.
///
/// An error is logged and counted by the session; it never stops the loop.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, message: &RawMessage) -> Result<()>;
}

/// Decode, classify and optionally tag each record.
pub struct ClassifyingHandler {
    classifier: Arc<dyn Classifier>,
    judge: FieldClassifier,
    decoder: PayloadDecoder,
    tagger: Option<SchemaTagger>,
    /// Fields already tagged per topic
    tagged: DashMap<String, BTreeSet<String>>,
    records: AtomicU64,
    detections: AtomicU64,
}

impl ClassifyingHandler {
    pub fn new(classifier: Arc<dyn Classifier>, config: &ClassifierConfig) -> Self {
        Self {
            classifier,
            judge: FieldClassifier::new(config.single_record()),
            decoder: PayloadDecoder::json(),
            tagger: None,
            tagged: DashMap::new(),
            records: AtomicU64::new(0),
            detections: AtomicU64::new(0),
        }
    }

    pub fn with_decoder(mut self, decoder: PayloadDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_tagger(mut self, tagger: SchemaTagger) -> Self {
        self.tagger = Some(tagger);
        self
    }

    /// Records that produced at least one field
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Field verdicts reported so far
    pub fn detections(&self) -> u64 {
        self.detections.load(Ordering::Relaxed)
    }

    /// Fields whose tags have not been pushed for `topic` yet
    fn untagged(&self, topic: &str, found: &[FieldClassification]) -> bool {
        let seen = self.tagged.get(topic);
        found
            .iter()
            .any(|c| seen.as_ref().map_or(true, |s| !s.contains(&c.field)))
    }

    async fn tag(&self, tagger: &SchemaTagger, topic: &str, found: &[FieldClassification]) -> Result<()> {
        if !self.untagged(topic, found) {
            return Ok(());
        }
        tagger.tag_topic(topic, found).await?;
        self.tagged
            .entry(topic.to_string())
            .or_default()
            .extend(found.iter().map(|c| c.field.clone()));
        Ok(())
    }
}

#[async_trait]
impl RecordHandler for ClassifyingHandler {
    async fn handle(&self, message: &RawMessage) -> Result<()> {
        let fields = self.decoder.decode(message.payload.as_deref()).await;
        if fields.is_empty() {
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Skipping undecodable record"
            );
            return Ok(());
        }
        self.records.fetch_add(1, Ordering::Relaxed);

        let input = ClassificationInput::from_fields(message.topic.clone(), &fields);
        let found = self.judge.classify(self.classifier.as_ref(), &input);
        if found.is_empty() {
            return Ok(());
        }
        self.detections.fetch_add(found.len() as u64, Ordering::Relaxed);

        for classification in &found {
            info!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                field = %classification.field,
                types = ?classification.pii_types,
                confidence = classification.confidence,
                "PII detected"
            );
        }

        if let Some(tagger) = &self.tagger {
            self.tag(tagger, &message.topic, &found).await?;
        }
        Ok(())
    }
}
