//! PII Sampler CLI
//!
//! Samples Kafka topics to find fields that carry personal data, either as a
//! one-off batch (`sample`) or continuously (`stream`).

use clap::{Parser, Subcommand};
use colored::Colorize;
use pii_sampler::CancellationFlag;
use pii_sampler_cli::{
    commands::{cancel_on_ctrl_c, SampleCommand, StreamCommand},
    CliResult,
};
use pii_sampler_config::{ObservabilityConfig, SamplerConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "pii-sampler",
    version,
    about = "Sample Kafka topics and classify fields that hold PII",
    long_about = "Samples Kafka topics to detect personally identifiable information.\n\n\
                  Modes:\n\
                  - sample: bounded, parallel sampling of many topics\n\
                  - stream: continuous consumption with durable offsets"
)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "PII_SAMPLER_CONFIG",
        value_name = "FILE",
        help = "Path to YAML configuration file"
    )]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    /// Print reports as JSON
    #[arg(long, global = true, help = "Print the final report as JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Batch sampling
    #[command(name = "sample", about = "Sample topics once and report PII fields")]
    Sample(SampleCommand),

    /// Streaming classification
    #[command(name = "stream", about = "Classify records continuously with resumable offsets")]
    Stream(StreamCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let config = SamplerConfig::load(cli.config.as_deref())?;
    init_tracing(&config.observability, cli.verbose);

    let cancel = CancellationFlag::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command {
        Commands::Sample(command) => command.execute(config, cli.json, cancel).await,
        Commands::Stream(command) => command.execute(config, cli.json, cancel).await,
    }
}

/// Initialize tracing/logging
fn init_tracing(observability: &ObservabilityConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&observability.log_level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if observability.json_logging {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
