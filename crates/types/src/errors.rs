//! Error types for policy validation

use thiserror::Error;

/// Result type alias for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Errors raised when a sampling policy is internally inconsistent
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("min_samples_per_partition ({min}) exceeds max_samples_per_partition ({max})")]
    MinExceedsMax { min: u64, max: u64 },

    #[error("sample_percentage must be in (0, 100], got {0}")]
    PercentageOutOfRange(f64),

    #[error("sample_time_window must be non-zero for the time_based strategy")]
    EmptyTimeWindow,

    #[error("max_partitions_per_topic must be at least 1 when set")]
    ZeroPartitionCap,

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
