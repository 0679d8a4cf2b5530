//! Sampled records and their per-topic aggregation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Flattened field path -> value
pub type FieldMap = BTreeMap<String, Value>;

/// One retrieved message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub partition: i32,
    pub offset: i64,
    pub fields: FieldMap,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Samples gathered from a single partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSamples {
    pub partition: i32,
    pub samples: Vec<SampleRecord>,
    /// Whether the partition met its sample target
    pub satisfied: bool,
    pub low_watermark: i64,
    pub high_watermark: i64,
    /// Set when the scan stopped on a read error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PartitionSamples {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Result of sampling one topic
///
/// Partitions appear in discovery order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSampleResult {
    pub topic: String,
    pub partitions: Vec<PartitionSamples>,
    pub satisfied_partitions: usize,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl TopicSampleResult {
    pub fn empty(topic: impl Into<String>, duration: Duration) -> Self {
        Self {
            topic: topic.into(),
            partitions: Vec::new(),
            satisfied_partitions: 0,
            duration,
        }
    }

    pub fn total_samples(&self) -> usize {
        self.partitions.iter().map(PartitionSamples::len).sum()
    }

    pub fn partition(&self, partition: i32) -> Option<&PartitionSamples> {
        self.partitions.iter().find(|p| p.partition == partition)
    }

    pub fn samples(&self) -> impl Iterator<Item = &SampleRecord> {
        self.partitions.iter().flat_map(|p| p.samples.iter())
    }
}

/// Field name -> sample values, the unit handed to a detection provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationInput {
    pub topic: String,
    pub fields: BTreeMap<String, Vec<Value>>,
    /// Number of records the values were drawn from
    pub record_count: usize,
}

impl ClassificationInput {
    /// Gather field values across every sampled partition of a topic
    pub fn from_result(result: &TopicSampleResult) -> Self {
        let mut input = Self {
            topic: result.topic.clone(),
            ..Default::default()
        };
        for record in result.samples() {
            input.push(&record.fields);
        }
        input
    }

    /// Build an input from a single decoded record
    pub fn from_fields(topic: impl Into<String>, fields: &FieldMap) -> Self {
        let mut input = Self {
            topic: topic.into(),
            ..Default::default()
        };
        input.push(fields);
        input
    }

    fn push(&mut self, fields: &FieldMap) {
        self.record_count += 1;
        for (name, value) in fields {
            if value.is_null() {
                continue;
            }
            self.fields.entry(name.clone()).or_default().push(value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(partition: i32, offset: i64, fields: &[(&str, Value)]) -> SampleRecord {
        SampleRecord {
            partition,
            offset,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            timestamp: None,
        }
    }

    #[test]
    fn test_classification_input_skips_nulls() {
        let result = TopicSampleResult {
            topic: "users".into(),
            partitions: vec![PartitionSamples {
                partition: 0,
                samples: vec![
                    record(0, 0, &[("email", json!("a@b.io")), ("age", Value::Null)]),
                    record(0, 5, &[("email", json!("c@d.io")), ("age", json!(41))]),
                ],
                satisfied: true,
                low_watermark: 0,
                high_watermark: 10,
                error: None,
            }],
            satisfied_partitions: 1,
            duration: Duration::from_millis(12),
        };

        let input = ClassificationInput::from_result(&result);
        assert_eq!(input.record_count, 2);
        assert_eq!(input.fields["email"].len(), 2);
        assert_eq!(input.fields["age"], vec![json!(41)]);
        assert_eq!(result.total_samples(), 2);
    }

    #[test]
    fn test_result_serializes_duration_as_millis() {
        let result = TopicSampleResult::empty("t", Duration::from_millis(1500));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], json!(1500));
        assert!(result.partition(0).is_none());
    }
}
