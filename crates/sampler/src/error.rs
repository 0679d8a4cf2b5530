//! Error types for the sampling engine and streaming session
//!
//! Transport failures carry their own [`KafkaError`]; the enums here cover
//! offset persistence, detection providers, the schema registry, and the
//! crate-level [`SamplerError`] that wraps them all.

use crate::kafka::KafkaError;
use pii_sampler_types::PolicyError;
use thiserror::Error;

/// Main error type
#[derive(Error, Debug)]
pub enum SamplerError {
    /// Log transport errors
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Offset store errors
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("schema registry error: {0}")]
    Schema(#[from] SchemaError),

    #[error("invalid sampling policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// The connection circuit opened and the session is configured to stop
    #[error("circuit open after {consecutive_failures} consecutive connection failures")]
    CircuitOpen { consecutive_failures: u32 },

    /// A record handler failed
    #[error("handler error: {source}")]
    Handler {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl SamplerError {
    pub fn handler(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Handler {
            source: source.into(),
        }
    }
}

/// Durable offset store errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("offset store I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The backing file exists but cannot be parsed
    #[error("offset store {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("offset serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by a detection provider for one field
#[derive(Error, Debug)]
pub enum ClassificationError {
    #[error("provider {provider} failed on field {field}: {reason}")]
    Provider {
        provider: String,
        field: String,
        reason: String,
    },

    #[error("invalid pattern {name}: {reason}")]
    InvalidPattern { name: String, reason: String },
}

/// Schema registry errors
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("schema registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("schema registry returned {status} for subject {subject}: {body}")]
    Status {
        status: u16,
        subject: String,
        body: String,
    },

    #[error("invalid schema for subject {subject}: {reason}")]
    InvalidSchema { subject: String, reason: String },

    #[error("failed to decode schema: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type for sampler operations
pub type Result<T> = std::result::Result<T, SamplerError>;

/// Result type for offset store operations
pub type StateResult<T> = std::result::Result<T, StateError>;

pub type SchemaResult<T> = std::result::Result<T, SchemaError>;
