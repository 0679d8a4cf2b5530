//! Sample command - batch sampling and classification of topics

use super::{build_classifier, build_decoder, build_tagger};
use crate::{CliError, CliResult};
use anyhow::Context;
use clap::{Args, ValueEnum};
use colored::Colorize;
use pii_sampler::classification::FieldClassifier;
use pii_sampler::kafka::KafkaTransport;
use pii_sampler::sampling::BatchReport;
use pii_sampler::{BatchSampler, CancellationFlag, SamplerError, SamplingCoordinator};
use pii_sampler_config::SamplerConfig;
use pii_sampler_types::SamplingStrategy;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyArg {
    Percentage,
    Count,
    TimeBased,
    All,
}

impl From<StrategyArg> for SamplingStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Percentage => SamplingStrategy::Percentage,
            StrategyArg::Count => SamplingStrategy::Count,
            StrategyArg::TimeBased => SamplingStrategy::TimeBased,
            StrategyArg::All => SamplingStrategy::All,
        }
    }
}

/// Sample a set of topics once and report the fields that hold PII
#[derive(Args, Debug, Clone, Default)]
pub struct SampleCommand {
    /// Topic to sample (repeatable); defaults to the configured list, then every topic
    #[arg(short, long = "topic", value_name = "TOPIC")]
    pub topics: Vec<String>,

    /// Sampling strategy
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,

    /// Percentage of each partition to sample
    #[arg(long, value_name = "PERCENT")]
    pub sample_percentage: Option<f64>,

    /// Upper bound on samples per partition
    #[arg(long, value_name = "N")]
    pub max_samples: Option<u64>,

    /// Lower bound on samples per partition
    #[arg(long, value_name = "N")]
    pub min_samples: Option<u64>,

    /// Stop a topic after this many partitions met their target
    #[arg(long, value_name = "N")]
    pub max_partitions: Option<usize>,

    /// Topics sampled concurrently
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Tag PII fields in the schema registry
    #[arg(long)]
    pub tag: bool,

    /// Also write the JSON report to this file
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

impl SampleCommand {
    /// Fold command-line overrides into the loaded configuration.
    pub fn apply(&self, config: &mut SamplerConfig) {
        if !self.topics.is_empty() {
            config.topics = self.topics.clone();
        }
        if let Some(strategy) = self.strategy {
            config.sampling.strategy = strategy.into();
        }
        if let Some(percentage) = self.sample_percentage {
            config.sampling.sample_percentage = percentage;
        }
        if let Some(max) = self.max_samples {
            config.sampling.max_samples_per_partition = max;
        }
        if let Some(min) = self.min_samples {
            config.sampling.min_samples_per_partition = min;
        }
        if let Some(limit) = self.max_partitions {
            config.sampling.max_partitions_per_topic = Some(limit);
        }
        if let Some(workers) = self.workers {
            config.parallel_workers = workers;
        }
        if self.tag {
            config.tagging.enabled = true;
        }
    }

    pub async fn execute(
        &self,
        mut config: SamplerConfig,
        json: bool,
        cancel: CancellationFlag,
    ) -> CliResult<()> {
        self.apply(&mut config);
        config.validate()?;

        let policy = config.sampling.to_policy().map_err(SamplerError::from)?;
        let transport = Arc::new(KafkaTransport::new(config.kafka.clone())?);
        let options = config.coordinator_options(format!("pii-sampler-scan-{}", Uuid::new_v4()));
        let coordinator =
            SamplingCoordinator::new(transport, policy, options).with_decoder(build_decoder(&config)?);

        let mut sampler = BatchSampler::new(
            coordinator,
            config.parallel_workers,
            build_classifier(&config)?,
            FieldClassifier::new(config.pii_detection.clone()),
        );
        if let Some(tagger) = build_tagger(&config)? {
            sampler = sampler.with_tagger(tagger);
        }

        let report = sampler.run(&config.topics, &cancel).await?;

        if let Some(path) = &self.output {
            let body = serde_json::to_string_pretty(&report)?;
            std::fs::write(path, body)
                .with_context(|| format!("writing report to {}", path.display()))?;
        }

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report);
        }

        if report.topics.is_empty() && !report.failures.is_empty() {
            return Err(CliError::OperationFailed(format!(
                "all {} topic(s) failed to sample",
                report.failures.len()
            )));
        }
        Ok(())
    }
}

fn print_report(report: &BatchReport) {
    println!("{}", "PII Sampling Report".bold().cyan());
    println!("{}", "=".repeat(40));

    for topic in &report.topics {
        let status = if topic.has_pii() {
            "!".yellow()
        } else {
            "✓".green()
        };
        println!(
            "  {} {} ({} samples, {}/{} partitions satisfied, {}ms)",
            status,
            topic.topic.bold(),
            topic.samples,
            topic.satisfied_partitions,
            topic.partitions,
            topic.duration.as_millis()
        );
        for field in &topic.fields {
            let types: Vec<&str> = field.pii_types.iter().map(|t| t.as_str()).collect();
            println!(
                "      {} [{}] confidence {:.2}, rate {:.2}",
                field.field,
                types.join(", ").yellow(),
                field.confidence,
                field.detection_rate
            );
        }
        if let Some(id) = topic.schema_id {
            println!("      {} schema id {}", "tagged".green(), id);
        }
        if let Some(error) = &topic.tagging_error {
            println!("      {} {}", "tagging failed:".red(), error);
        }
    }

    for failure in &report.failures {
        println!("  {} {}: {}", "✗".red(), failure.topic.bold(), failure.error);
    }

    println!();
    println!("{}", "Summary:".bold().cyan());
    println!("  Topics:     {}", report.topics.len());
    println!(
        "  With PII:   {}",
        report.pii_topics().count().to_string().yellow()
    );
    println!("  Samples:    {}", report.total_samples());
    if !report.failures.is_empty() {
        println!("  Failed:     {}", report.failures.len().to_string().red());
    }
    if report.cancelled {
        println!(
            "  Cancelled:  {} topic(s) not started",
            report.skipped.len().to_string().yellow()
        );
    }
    println!("  Duration:   {:.2}s", report.duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_to_config() {
        let command = SampleCommand {
            topics: vec!["users".to_string()],
            strategy: Some(StrategyArg::Count),
            max_samples: Some(250),
            workers: Some(2),
            tag: true,
            ..SampleCommand::default()
        };
        let mut config = SamplerConfig::default();
        command.apply(&mut config);

        assert_eq!(config.topics, vec!["users".to_string()]);
        assert_eq!(config.sampling.strategy, SamplingStrategy::Count);
        assert_eq!(config.sampling.max_samples_per_partition, 250);
        assert_eq!(config.sampling.min_samples_per_partition, 10);
        assert_eq!(config.parallel_workers, 2);
        assert!(config.tagging.enabled);
    }

    #[test]
    fn test_no_overrides_keep_config() {
        let mut config = SamplerConfig::default();
        config.topics = vec!["payments".to_string()];
        SampleCommand::default().apply(&mut config);
        assert_eq!(config.topics, vec!["payments".to_string()]);
        assert_eq!(config, {
            let mut expected = SamplerConfig::default();
            expected.topics = vec!["payments".to_string()];
            expected
        });
    }
}
