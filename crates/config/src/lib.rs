//! Configuration management for the PII topic sampler
//!
//! Values come from an optional YAML file, overridden by environment
//! variables prefixed with `PII_SAMPLER_` (nested keys split on `__`, e.g.
//! `PII_SAMPLER_KAFKA__BOOTSTRAP_SERVERS`). Every field has a default, so an
//! empty file is a valid configuration.

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use pii_sampler::classification::ClassifierConfig;
use pii_sampler::kafka::config::duration_millis;
use pii_sampler::kafka::KafkaClientConfig;
use pii_sampler::sampling::{CoordinatorOptions, ScanOptions};
use pii_sampler::schema::SchemaRegistryConfig;
use pii_sampler::streaming::StreamingConfig;
use pii_sampler_types::{OffsetReset, SamplingPolicy, SamplingStrategy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "PII_SAMPLER_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main sampler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplerConfig {
    #[serde(default)]
    pub kafka: KafkaClientConfig,

    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Topics sampled concurrently in batch mode
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,

    /// Partition scans in flight per topic
    #[serde(default = "default_max_parallel_partitions")]
    pub max_parallel_partitions: usize,

    /// Topics to process; empty means every non-internal topic
    #[serde(default)]
    pub topics: Vec<String>,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub pii_detection: ClassifierConfig,

    #[serde(default)]
    pub schema_registry: SchemaRegistryConfig,

    #[serde(default)]
    pub tagging: TaggingConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_parallel_workers() -> usize {
    10
}

fn default_max_parallel_partitions() -> usize {
    30
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            kafka: KafkaClientConfig::default(),
            sampling: SamplingConfig::default(),
            parallel_workers: default_parallel_workers(),
            max_parallel_partitions: default_max_parallel_partitions(),
            topics: Vec::new(),
            streaming: StreamingConfig::default(),
            pii_detection: ClassifierConfig::default(),
            schema_registry: SchemaRegistryConfig::default(),
            tagging: TaggingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl SamplerConfig {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConfigError::LoadError(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))
    }

    /// Check every cross-field constraint
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| ConfigError::ValidationError(msg);

        self.kafka
            .validate()
            .map_err(|e| invalid(format!("kafka: {e}")))?;
        self.sampling
            .to_policy()
            .map_err(|e| invalid(format!("sampling: {e}")))?;
        self.sampling
            .validate()
            .map_err(|e| invalid(format!("sampling: {e}")))?;

        if self.parallel_workers == 0 {
            return Err(invalid("parallel_workers must be greater than 0".to_string()));
        }
        if self.max_parallel_partitions == 0 {
            return Err(invalid(
                "max_parallel_partitions must be greater than 0".to_string(),
            ));
        }
        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(invalid("topics must not contain empty names".to_string()));
        }

        self.streaming
            .validate()
            .map_err(|e| invalid(format!("streaming: {e}")))?;
        self.pii_detection
            .validate()
            .map_err(|e| invalid(format!("pii_detection: {e}")))?;
        self.schema_registry
            .validate()
            .map_err(|e| invalid(format!("schema_registry: {e}")))?;

        if self.tagging.enabled && self.schema_registry.url.is_none() {
            return Err(invalid(
                "tagging.enabled requires schema_registry.url".to_string(),
            ));
        }
        Ok(())
    }

    /// Options for the per-topic sampling coordinator
    pub fn coordinator_options(&self, scan_group_id: impl Into<String>) -> CoordinatorOptions {
        CoordinatorOptions {
            max_parallel_partitions: self.max_parallel_partitions,
            partition_timeout: Some(self.sampling.partition_timeout),
            scan: ScanOptions {
                poll_timeout: self.sampling.poll_timeout,
                group_id: scan_group_id.into(),
            },
        }
    }
}

/// Batch sampling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingConfig {
    #[serde(default)]
    pub strategy: SamplingStrategy,

    /// Percent of each partition; values below 1.0 are a fraction
    #[serde(default = "default_sample_percentage")]
    pub sample_percentage: f64,

    #[serde(default = "default_max_samples")]
    pub max_samples_per_partition: u64,

    #[serde(default = "default_min_samples")]
    pub min_samples_per_partition: u64,

    /// `"1h"`, `"30m"`, `"7d"`, `"45s"` or plain seconds
    #[serde(default = "default_time_window", with = "time_window")]
    pub sample_time_window: Duration,

    #[serde(default = "default_true")]
    pub use_skip_based_sampling: bool,

    #[serde(default = "default_true")]
    pub enable_early_termination: bool,

    #[serde(default)]
    pub max_partitions_per_topic: Option<usize>,

    #[serde(default)]
    pub offset_reset: OffsetReset,

    #[serde(default = "default_partition_timeout", with = "duration_millis")]
    pub partition_timeout: Duration,

    #[serde(default = "default_poll_timeout", with = "duration_millis")]
    pub poll_timeout: Duration,
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

fn default_partition_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            strategy: SamplingStrategy::default(),
            sample_percentage: default_sample_percentage(),
            max_samples_per_partition: default_max_samples(),
            min_samples_per_partition: default_min_samples(),
            sample_time_window: default_time_window(),
            use_skip_based_sampling: true,
            enable_early_termination: true,
            max_partitions_per_topic: None,
            offset_reset: OffsetReset::default(),
            partition_timeout: default_partition_timeout(),
            poll_timeout: default_poll_timeout(),
        }
    }
}

impl SamplingConfig {
    /// Validated, immutable policy for the sampling engine
    pub fn to_policy(&self) -> std::result::Result<SamplingPolicy, pii_sampler_types::PolicyError> {
        let policy = SamplingPolicy {
            strategy: self.strategy,
            sample_percentage: self.sample_percentage,
            max_samples_per_partition: self.max_samples_per_partition,
            min_samples_per_partition: self.min_samples_per_partition,
            sample_time_window: self.sample_time_window,
            use_skip_based_sampling: self.use_skip_based_sampling,
            early_termination: self.enable_early_termination,
            max_partitions_per_topic: self.max_partitions_per_topic,
            offset_reset: self.offset_reset,
        };
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.partition_timeout.is_zero() {
            return Err("partition_timeout must be greater than 0".to_string());
        }
        if self.poll_timeout.is_zero() {
            return Err("poll_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Schema tagging switch
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaggingConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable structured JSON logging
    #[serde(default)]
    pub json_logging: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: false,
        }
    }
}

/// Parse a lookback window such as `"1h"`, `"30m"`, `"7d"` or `"90"`.
pub fn parse_time_window(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid time window: {raw:?}"))?;
    let secs = match unit.trim() {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        other => return Err(format!("unknown time window unit {other:?} in {raw:?}")),
    };
    Ok(Duration::from_secs(secs))
}

mod time_window {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

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
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_time_window(&text).map_err(serde::de::Error::custom),
        }
    }
}
