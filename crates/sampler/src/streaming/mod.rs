//! Streaming mode: continuous, resumable consumption of a topic set.
//!
//! A [`StreamingSession`] polls, hands each record to a [`RecordHandler`],
//! tracks the next offset per partition and commits every
//! `commit_interval` records. Committed offsets are written to an
//! [`OffsetStore`](crate::kafka::OffsetStore) so a restarted session resumes
//! where the last commit left off.
//!
//! # Example
//!
//! ```rust,no_run
//! use pii_sampler::classification::{ClassifierConfig, PatternClassifier};
//! use pii_sampler::kafka::{FileOffsetStore, KafkaClientConfig, KafkaTransport};
//! use pii_sampler::sampling::CancellationFlag;
//! use pii_sampler::streaming::{ClassifyingHandler, StreamingConfig, StreamingSession};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StreamingConfig::default();
//! let transport = Arc::new(KafkaTransport::new(KafkaClientConfig::default())?);
//! let store = Arc::new(FileOffsetStore::new(&config.offset_file));
//! let classifier = Arc::new(PatternClassifier::new(&[])?);
//! let handler = Arc::new(ClassifyingHandler::new(classifier, &ClassifierConfig::default()));
//!
//! let mut session = StreamingSession::new(
//!     transport,
//!     store,
//!     vec!["user-events".to_string()],
//!     "pii-classification-streaming",
//!     config,
//!     handler,
//! );
//! let report = session.run(CancellationFlag::new()).await?.into_result()?;
//! println!("processed {} records", report.stats.processed);
//! # Ok(())
//! # }
//! ```

mod handler;
mod session;

pub use handler::{ClassifyingHandler, RecordHandler};
pub use session::{
    SessionReport, SessionStats, StreamingConfig, StreamingSession, TerminationReason,
};
