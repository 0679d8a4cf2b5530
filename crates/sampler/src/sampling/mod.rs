//! Batch sampling of topic partitions.
//!
//! - [`PartitionScanner`]: bounded read of one partition, skip-based or
//!   sequential, with early termination
//! - [`SamplingCoordinator`]: fans scans out over a topic's partitions and
//!   enforces the partition cap
//! - [`BatchSampler`]: runs the coordinator over many topics and hands the
//!   samples to classification and tagging

pub mod batch;
pub mod coordinator;
pub mod decode;
pub mod scanner;

pub use batch::{BatchReport, BatchSampler, TopicFailure, TopicReport};
pub use coordinator::{CoordinatorOptions, SamplingCoordinator};
pub use decode::{decode_fields, parse_json, wire_header, PayloadDecoder};
pub use scanner::{
    CancellationFlag, PartitionCursor, PartitionScanner, ScanBudget, ScanOptions, ScanOutcome,
    ScanStop,
};
