//! Stream command - continuous classification with resumable offsets

use super::{build_classifier, build_decoder, build_tagger};
use crate::{CliError, CliResult};
use clap::Args;
use colored::Colorize;
use pii_sampler::kafka::{FileOffsetStore, KafkaTransport};
use pii_sampler::streaming::{ClassifyingHandler, TerminationReason};
use pii_sampler::{CancellationFlag, SessionReport, StreamingSession};
use pii_sampler_config::SamplerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Consume topics continuously, classifying every record
#[derive(Args, Debug, Clone, Default)]
pub struct StreamCommand {
    /// Topic to consume (repeatable); defaults to the configured list
    #[arg(short, long = "topic", value_name = "TOPIC")]
    pub topics: Vec<String>,

    /// Consumer group id
    #[arg(long, value_name = "GROUP")]
    pub group_id: Option<String>,

    /// File holding committed offsets between runs
    #[arg(long, value_name = "FILE")]
    pub offset_file: Option<PathBuf>,

    /// Records processed between commits
    #[arg(long, value_name = "N")]
    pub commit_interval: Option<u64>,

    /// Exit with an error the first time the connection circuit opens
    #[arg(long)]
    pub terminate_on_circuit_open: bool,

    /// Tag PII fields in the schema registry
    #[arg(long)]
    pub tag: bool,
}

impl StreamCommand {
    /// Fold command-line overrides into the loaded configuration.
    pub fn apply(&self, config: &mut SamplerConfig) {
        if !self.topics.is_empty() {
            config.topics = self.topics.clone();
        }
        if let Some(group_id) = &self.group_id {
            config.kafka.group_id = group_id.clone();
        }
        if let Some(path) = &self.offset_file {
            config.streaming.offset_file = path.clone();
        }
        if let Some(interval) = self.commit_interval {
            config.streaming.commit_interval = interval;
        }
        if self.terminate_on_circuit_open {
            config.streaming.terminate_on_circuit_open = true;
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
        if config.topics.is_empty() {
            return Err(CliError::OperationFailed(
                "streaming needs at least one topic (--topic or `topics` in the config)"
                    .to_string(),
            ));
        }

        let transport = Arc::new(KafkaTransport::new(config.kafka.clone())?);
        let store = Arc::new(FileOffsetStore::new(&config.streaming.offset_file));

        let mut handler = ClassifyingHandler::new(build_classifier(&config)?, &config.pii_detection)
            .with_decoder(build_decoder(&config)?);
        if let Some(tagger) = build_tagger(&config)? {
            handler = handler.with_tagger(tagger);
        }
        let handler = Arc::new(handler);

        info!(
            topics = ?config.topics,
            group_id = %config.kafka.group_id,
            offset_file = %config.streaming.offset_file.display(),
            "Starting streaming classification"
        );

        let mut session = StreamingSession::new(
            transport,
            store,
            config.topics.clone(),
            config.kafka.group_id.clone(),
            config.streaming.clone(),
            handler.clone(),
        );
        let report = session.run(cancel).await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report, handler.detections());
        }

        report.into_result()?;
        Ok(())
    }
}

fn print_report(report: &SessionReport, detections: u64) {
    let status = match report.termination {
        TerminationReason::Shutdown => "shutdown".green(),
        TerminationReason::CircuitOpen => "circuit open".red(),
    };
    println!("{} ({})", "Streaming Session".bold().cyan(), status);
    println!("{}", "=".repeat(40));
    println!("  Topics:              {}", report.topics.join(", "));
    println!("  Processed:           {}", report.stats.processed);
    println!("  PII detections:      {}", detections.to_string().yellow());
    println!("  Handler failures:    {}", report.stats.handler_failures);
    println!(
        "  Commits:             {} ({} failed)",
        report.stats.commits, report.stats.commit_failures
    );
    println!(
        "  Connection failures: {} ({} reconnects, {} circuit opens)",
        report.stats.connection_failures, report.stats.reconnects, report.stats.circuit_opens
    );
    println!("  Duration:            {:.2}s", report.duration.as_secs_f64());
}
