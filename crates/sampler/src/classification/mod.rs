//! Detection capability and per-field verdicts.
//!
//! A [`Classifier`] is any provider that looks at the sample values of one
//! field and reports PII findings. [`FieldClassifier`] applies the
//! confidence and detection-rate thresholds on top of raw findings.

mod patterns;

pub use patterns::PatternClassifier;

use crate::error::ClassificationError;
use pii_sampler_types::{ClassificationInput, Detection, FieldClassification, PiiType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// A pluggable PII detection provider.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect the sample values of one field.
    fn classify(&self, field: &str, samples: &[Value]) -> Result<Vec<Detection>, ClassificationError>;
}

/// Run `classifier` over every field of `input`.
///
/// A field whose classification fails is logged and reported with no
/// detections.
pub fn classify_input(
    classifier: &dyn Classifier,
    input: &ClassificationInput,
) -> BTreeMap<String, Vec<Detection>> {
    input
        .fields
        .iter()
        .map(|(field, samples)| {
            let detections = classifier.classify(field, samples).unwrap_or_else(|e| {
                warn!(
                    topic = %input.topic,
                    field,
                    provider = classifier.name(),
                    error = %e,
                    "Field classification failed"
                );
                Vec::new()
            });
            (field.clone(), detections)
        })
        .collect()
}

/// Thresholds for turning raw detections into field verdicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Fraction of samples that must match
    #[serde(default = "default_min_detection_rate")]
    pub min_detection_rate: f64,

    /// Require at least two matching samples
    #[serde(default = "default_true")]
    pub require_multiple_detections: bool,

    /// Types to report; empty means all
    #[serde(default)]
    pub enabled_types: Vec<PiiType>,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_min_detection_rate() -> f64 {
    0.3
}

fn default_true() -> bool {
    true
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            min_detection_rate: default_min_detection_rate(),
            require_multiple_detections: true,
            enabled_types: Vec::new(),
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err("confidence_threshold must be between 0 and 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_detection_rate) {
            return Err("min_detection_rate must be between 0 and 1".to_string());
        }
        Ok(())
    }

    /// Rules for judging a single record, where multiple matches are impossible.
    pub fn single_record(&self) -> Self {
        Self {
            require_multiple_detections: false,
            ..self.clone()
        }
    }
}

/// Applies [`ClassifierConfig`] thresholds to provider output.
#[derive(Debug, Clone, Default)]
pub struct FieldClassifier {
    config: ClassifierConfig,
}

impl FieldClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn accepts(&self, detection: &Detection, sample_count: usize) -> bool {
        if sample_count == 0 {
            return false;
        }
        if !self.config.enabled_types.is_empty()
            && !self.config.enabled_types.contains(&detection.pii_type)
        {
            return false;
        }
        if self.config.require_multiple_detections && detection.matched_samples < 2 {
            return false;
        }
        let rate = detection.matched_samples as f64 / sample_count as f64;
        detection.confidence >= self.config.confidence_threshold
            && rate >= self.config.min_detection_rate
    }

    /// Fields judged to hold PII, in field order.
    pub fn evaluate(
        &self,
        input: &ClassificationInput,
        detections: &BTreeMap<String, Vec<Detection>>,
    ) -> Vec<FieldClassification> {
        detections
            .iter()
            .filter_map(|(field, found)| {
                let sample_count = input.fields.get(field).map_or(0, Vec::len);
                let accepted: Vec<Detection> = found
                    .iter()
                    .filter(|d| self.accepts(d, sample_count))
                    .cloned()
                    .collect();
                (!accepted.is_empty())
                    .then(|| FieldClassification::new(field.clone(), &accepted, sample_count))
            })
            .collect()
    }

    /// Classify and judge in one step.
    pub fn classify(
        &self,
        classifier: &dyn Classifier,
        input: &ClassificationInput,
    ) -> Vec<FieldClassification> {
        let detections = classify_input(classifier, input);
        self.evaluate(input, &detections)
    }
}
