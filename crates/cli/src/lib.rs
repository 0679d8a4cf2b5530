//! Command-line front end for the PII topic sampler

pub mod commands;

use pii_sampler::kafka::KafkaError;
use pii_sampler::{SamplerError, SchemaError};
use pii_sampler_config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error("kafka: {0}")]
    Kafka(#[from] KafkaError),

    #[error("schema registry: {0}")]
    Schema(#[from] SchemaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    OperationFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CliResult<T> = std::result::Result<T, CliError>;
