//! Topic sampling engine and resilient streaming consumer for PII discovery
//! on Kafka.
//!
//! Two entry points share the same transport and classification layers:
//!
//! - **Batch mode**: [`sampling::BatchSampler`] samples a bounded set of
//!   records from every partition of each topic and classifies the fields
//! - **Streaming mode**: [`streaming::StreamingSession`] consumes
//!   continuously, classifying each record, with durable offsets and a
//!   connection circuit breaker

pub mod classification;
pub mod error;
pub mod kafka;
pub mod resilience;
pub mod sampling;
pub mod schema;
pub mod streaming;

pub use error::{ClassificationError, Result, SamplerError, SchemaError, StateError};
pub use kafka::{KafkaError, LogReader, LogTransport, MemoryTransport, RawMessage, TopicPartition};
pub use sampling::{BatchReport, BatchSampler, CancellationFlag, SamplingCoordinator};
pub use streaming::{RecordHandler, SessionReport, StreamingConfig, StreamingSession};

pub use pii_sampler_types as types;
