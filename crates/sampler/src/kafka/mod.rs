//! Kafka integration for the sampler.
//!
//! This module provides the log-transport layer the sampling engine and the
//! streaming session are built on:
//!
//! - **Transport traits**: [`LogTransport`] / [`LogReader`] expose partition
//!   discovery, watermarks, seeks, polls and commits
//! - **rdkafka backend**: [`KafkaTransport`] over `StreamConsumer`
//! - **In-memory backend**: [`MemoryTransport`] with failure injection
//! - **Offset management**: [`OffsetManager`] with file and in-memory stores
//!
//! # Example
//!
//! ```rust,no_run
//! use pii_sampler::kafka::{KafkaClientConfig, KafkaTransport, LogTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = KafkaTransport::new(KafkaClientConfig::default())?;
//! for partition in transport.list_partitions("user-events").await? {
//!     let (low, high) = transport.watermarks("user-events", partition).await?;
//!     println!("partition {partition}: {} messages", high - low);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod offset_manager;
pub mod transport;

pub use client::{KafkaReader, KafkaTransport};
pub use config::{KafkaClientConfig, SaslConfig, SaslMechanism, SecurityProtocol, SslConfig};
pub use error::{KafkaError, Result};
pub use memory::{MemoryReader, MemoryTransport};
pub use offset_manager::{
    FileOffsetStore, InMemoryOffsetStore, OffsetEntry, OffsetManager, OffsetMap, OffsetStats,
    OffsetStore,
};
pub use transport::{LogReader, LogTransport, Position, RawMessage, TopicPartition};
