//! Sampling policy and per-partition target computation

use crate::errors::{PolicyError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a partition's sample target is derived
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// A percentage of the partition, clamped to the min/max bounds
    #[default]
    Percentage,
    /// Always `max_samples_per_partition`
    Count,
    /// Bounded by a lookback window instead of a count
    TimeBased,
    /// Every message in the partition
    All,
}

impl SamplingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingStrategy::Percentage => "percentage",
            SamplingStrategy::Count => "count",
            SamplingStrategy::TimeBased => "time_based",
            SamplingStrategy::All => "all",
        }
    }
}

/// Where a reader starts when no explicit position is known
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Per-partition sample bounds computed from a policy and a partition size
///
/// A scan stops once `limit` samples are collected and reports itself
/// satisfied when it holds at least `satisfied_at` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleTarget {
    pub limit: u64,
    pub satisfied_at: u64,
}

impl SampleTarget {
    fn exact(n: u64) -> Self {
        Self {
            limit: n,
            satisfied_at: n,
        }
    }

    pub fn is_satisfied(&self, collected: u64) -> bool {
        collected >= self.satisfied_at
    }
}

/// Immutable sampling configuration handed to every scanner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingPolicy {
    #[serde(default)]
    pub strategy: SamplingStrategy,

    /// Percentage of each partition to sample. Values below 1.0 are read
    /// as a fraction (0.05 == 5%).
    #[serde(default = "default_sample_percentage")]
    pub sample_percentage: f64,

    #[serde(default = "default_max_samples")]
    pub max_samples_per_partition: u64,

    #[serde(default = "default_min_samples")]
    pub min_samples_per_partition: u64,

    /// Lookback window for the time-based strategy
    #[serde(default = "default_time_window", with = "duration_secs")]
    pub sample_time_window: Duration,

    #[serde(default = "default_true")]
    pub use_skip_based_sampling: bool,

    #[serde(default = "default_true")]
    pub early_termination: bool,

    /// Stop a topic once this many partitions have met their target
    #[serde(default)]
    pub max_partitions_per_topic: Option<usize>,

    /// Starting point for sequential scans
    #[serde(default)]
    pub offset_reset: OffsetReset,
}

fn default_sample_percentage() -> f64 {
    10.0
}

fn default_max_samples() -> u64 {
    100
}

fn default_min_samples() -> u64 {
    10
}

fn default_time_window() -> Duration {
    Duration::from_secs(3600)
}

fn default_true() -> bool {
    true
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            strategy: SamplingStrategy::default(),
            sample_percentage: default_sample_percentage(),
            max_samples_per_partition: default_max_samples(),
            min_samples_per_partition: default_min_samples(),
            sample_time_window: default_time_window(),
            use_skip_based_sampling: true,
            early_termination: true,
            max_partitions_per_topic: None,
            offset_reset: OffsetReset::Earliest,
        }
    }
}

impl SamplingPolicy {
    /// Check the cross-field invariants of the policy
    pub fn validate(&self) -> Result<()> {
        if self.min_samples_per_partition > self.max_samples_per_partition {
            return Err(PolicyError::MinExceedsMax {
                min: self.min_samples_per_partition,
                max: self.max_samples_per_partition,
            });
        }

        let pct = self.percentage();
        if !(pct > 0.0 && pct <= 100.0) {
            return Err(PolicyError::PercentageOutOfRange(self.sample_percentage));
        }

        if self.strategy == SamplingStrategy::TimeBased && self.sample_time_window.is_zero() {
            return Err(PolicyError::EmptyTimeWindow);
        }

        if self.max_partitions_per_topic == Some(0) {
            return Err(PolicyError::ZeroPartitionCap);
        }

        Ok(())
    }

    /// Sample percentage on a 0-100 scale
    pub fn percentage(&self) -> f64 {
        if self.sample_percentage > 0.0 && self.sample_percentage < 1.0 {
            self.sample_percentage * 100.0
        } else {
            self.sample_percentage
        }
    }

    /// Compute the sample bounds for a partition holding `partition_size` messages
    pub fn target(&self, partition_size: u64) -> SampleTarget {
        match self.strategy {
            SamplingStrategy::Percentage => {
                let raw = (partition_size as f64 * self.percentage() / 100.0).floor() as u64;
                SampleTarget::exact(raw.clamp(
                    self.min_samples_per_partition,
                    self.max_samples_per_partition,
                ))
            }
            SamplingStrategy::Count => SampleTarget::exact(self.max_samples_per_partition),
            SamplingStrategy::TimeBased => SampleTarget {
                limit: self.max_samples_per_partition,
                satisfied_at: self.min_samples_per_partition,
            },
            SamplingStrategy::All => SampleTarget::exact(partition_size),
        }
    }

    /// Whether the scanner should seek to evenly spaced offsets
    pub fn skip_based(&self) -> bool {
        self.use_skip_based_sampling && self.strategy != SamplingStrategy::TimeBased
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
