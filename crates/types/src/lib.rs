//! Core types and data models for the PII topic sampler
//!
//! This crate provides the data structures shared by the sampling engine,
//! the streaming consumer, the configuration layer and the CLI.

pub mod detection;
pub mod errors;
pub mod policy;
pub mod records;

pub use detection::{Detection, FieldClassification, PiiType};
pub use errors::{PolicyError, Result};
pub use policy::{OffsetReset, SampleTarget, SamplingPolicy, SamplingStrategy};
pub use records::{
    ClassificationInput, FieldMap, PartitionSamples, SampleRecord, TopicSampleResult,
};
