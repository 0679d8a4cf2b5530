//! Log-transport errors

use rdkafka::error::KafkaError as RdKafkaError;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KafkaError>;

/// Failure of a single transport call.
///
/// The sampling engine contains these per partition; the streaming session
/// feeds them to its connection circuit breaker.
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Broker unreachable or client construction failed
    #[error("cannot reach {broker}: {message}")]
    Connection { broker: String, message: String },

    #[error("read from {topic} failed: {message}")]
    Consumption {
        topic: String,
        partition: Option<i32>,
        message: String,
    },

    #[error("invalid client configuration: {0}")]
    InvalidConfiguration(String),

    #[error("offset commit for group {group_id} rejected: {message}")]
    OffsetCommit { group_id: String, message: String },

    #[error("metadata request for {topic} failed: {message}")]
    TopicMetadata { topic: String, message: String },

    #[error("partition {topic}/{partition} does not exist")]
    PartitionNotFound { topic: String, partition: i32 },

    /// Credentials or ACLs rejected by the broker
    #[error("not authorized: {0}")]
    Auth(String),

    #[error("librdkafka error {code:?}: {message}")]
    Client {
        code: Option<RDKafkaErrorCode>,
        message: String,
    },

    #[error("{0}")]
    Other(String),
}

impl KafkaError {
    pub fn connection(message: impl Into<String>, broker: impl Into<String>) -> Self {
        Self::Connection {
            broker: broker.into(),
            message: message.into(),
        }
    }

    pub fn consumption(
        message: impl Into<String>,
        topic: impl Into<String>,
        partition: Option<i32>,
    ) -> Self {
        Self::Consumption {
            topic: topic.into(),
            partition,
            message: message.into(),
        }
    }

    pub fn offset_commit(message: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self::OffsetCommit {
            group_id: group_id.into(),
            message: message.into(),
        }
    }

    pub fn topic_metadata(message: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::TopicMetadata {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn partition_not_found(topic: impl Into<String>, partition: i32) -> Self {
        Self::PartitionNotFound {
            topic: topic.into(),
            partition,
        }
    }

    /// Reconnecting cannot fix these; the operator has to.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::InvalidConfiguration(_))
    }
}

fn is_auth_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
    )
}

fn is_transport_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::NetworkException
    )
}

impl From<RdKafkaError> for KafkaError {
    fn from(err: RdKafkaError) -> Self {
        let code = err.rdkafka_error_code();
        if let Some(code) = code {
            if is_auth_code(code) {
                return KafkaError::Auth(err.to_string());
            }
            if is_transport_code(code) {
                return KafkaError::connection(err.to_string(), "cluster");
            }
        }
        match err {
            RdKafkaError::ClientConfig(_, _, _, _) => KafkaError::InvalidConfiguration(err.to_string()),
            RdKafkaError::ClientCreation(msg) => KafkaError::connection(msg, "cluster"),
            RdKafkaError::MetadataFetch(_) => KafkaError::topic_metadata(err.to_string(), "*"),
            RdKafkaError::ConsumerCommit(_) | RdKafkaError::StoreOffset(_) => {
                KafkaError::offset_commit(err.to_string(), "*")
            }
            RdKafkaError::PartitionEOF(partition) => {
                KafkaError::consumption("end of partition", "*", Some(partition))
            }
            RdKafkaError::MessageConsumption(_) => KafkaError::consumption(err.to_string(), "*", None),
            other => KafkaError::Client {
                message: other.to_string(),
                code,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(KafkaError::Auth("bad password".into()).is_fatal());
        assert!(KafkaError::InvalidConfiguration("no brokers".into()).is_fatal());
        assert!(!KafkaError::connection("refused", "localhost:9092").is_fatal());
        assert!(!KafkaError::offset_commit("rebalancing", "g1").is_fatal());
    }

    #[test]
    fn test_display() {
        let err = KafkaError::partition_not_found("orders", 7);
        assert_eq!(err.to_string(), "partition orders/7 does not exist");
    }

    #[test]
    fn test_rdkafka_conversion() {
        let down: KafkaError = RdKafkaError::MessageConsumption(RDKafkaErrorCode::AllBrokersDown).into();
        assert!(matches!(down, KafkaError::Connection { .. }));

        let denied: KafkaError =
            RdKafkaError::MessageConsumption(RDKafkaErrorCode::TopicAuthorizationFailed).into();
        assert!(denied.is_fatal());

        let commit: KafkaError = RdKafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress).into();
        assert!(matches!(commit, KafkaError::OffsetCommit { .. }));

        let eof: KafkaError = RdKafkaError::PartitionEOF(3).into();
        assert!(matches!(eof, KafkaError::Consumption { partition: Some(3), .. }));
    }
}
