//! Client configuration for the Kafka transport.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Connection settings shared by the batch scanner and the streaming session.
///
/// # Example
///
/// ```rust
/// use pii_sampler::kafka::KafkaClientConfig;
///
/// let config = KafkaClientConfig {
///     bootstrap_servers: "broker-1:9092,broker-2:9092".to_string(),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KafkaClientConfig {
    /// Comma separated broker list.
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,

    /// Consumer group used by the streaming session.
    #[serde(default = "default_group_id")]
    pub group_id: String,

    #[serde(default)]
    pub security_protocol: SecurityProtocol,

    #[serde(default)]
    pub sasl: Option<SaslConfig>,

    #[serde(default)]
    pub ssl: Option<SslConfig>,

    #[serde(default = "default_session_timeout", with = "duration_millis")]
    pub session_timeout: Duration,

    /// Upper bound for metadata and watermark requests.
    #[serde(default = "default_request_timeout", with = "duration_millis")]
    pub request_timeout: Duration,

    /// Extra librdkafka properties, applied last.
    #[serde(default)]
    pub additional_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_group_id() -> String {
    "pii-classification-streaming".to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for KafkaClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            group_id: default_group_id(),
            security_protocol: SecurityProtocol::default(),
            sasl: None,
            ssl: None,
            session_timeout: default_session_timeout(),
            request_timeout: default_request_timeout(),
            additional_properties: HashMap::new(),
        }
    }
}

/// Security protocol for Kafka connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "PLAINTEXT",
            SecurityProtocol::Ssl => "SSL",
            SecurityProtocol::SaslPlaintext => "SASL_PLAINTEXT",
            SecurityProtocol::SaslSsl => "SASL_SSL",
        }
    }

    pub fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SaslMechanism {
    #[default]
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SASL credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

/// SSL/TLS file locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SslConfig {
    pub ca_location: Option<String>,
    pub certificate_location: Option<String>,
    pub key_location: Option<String>,
    pub key_password: Option<String>,
}

impl KafkaClientConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err("bootstrap_servers cannot be empty".to_string());
        }

        if self.group_id.trim().is_empty() {
            return Err("group_id cannot be empty".to_string());
        }

        if self.security_protocol.uses_sasl() && self.sasl.is_none() {
            return Err(format!(
                "sasl credentials required when using {} security protocol",
                self.security_protocol.as_str()
            ));
        }

        if self.request_timeout.is_zero() {
            return Err("request_timeout must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Render librdkafka properties for a consumer in `group_id`.
    ///
    /// Offsets are always committed explicitly, so auto commit is disabled.
    pub fn to_rdkafka_properties(&self, group_id: &str) -> HashMap<String, String> {
        let mut props = HashMap::new();

        props.insert(
            "bootstrap.servers".to_string(),
            self.bootstrap_servers.clone(),
        );
        props.insert("group.id".to_string(), group_id.to_string());
        props.insert("enable.auto.commit".to_string(), "false".to_string());
        props.insert("enable.auto.offset.store".to_string(), "false".to_string());
        props.insert("enable.partition.eof".to_string(), "false".to_string());
        props.insert(
            "session.timeout.ms".to_string(),
            self.session_timeout.as_millis().to_string(),
        );
        props.insert(
            "security.protocol".to_string(),
            self.security_protocol.as_str().to_string(),
        );

        if let Some(sasl) = &self.sasl {
            props.insert("sasl.mechanism".to_string(), sasl.mechanism.as_str().to_string());
            props.insert("sasl.username".to_string(), sasl.username.clone());
            props.insert("sasl.password".to_string(), sasl.password.clone());
        }

        if let Some(ssl) = &self.ssl {
            let files = [
                ("ssl.ca.location", &ssl.ca_location),
                ("ssl.certificate.location", &ssl.certificate_location),
                ("ssl.key.location", &ssl.key_location),
                ("ssl.key.password", &ssl.key_password),
            ];
            for (key, value) in files {
                if let Some(value) = value {
                    props.insert(key.to_string(), value.clone());
                }
            }
        }

        for (key, value) in &self.additional_properties {
            props.insert(key.clone(), value.clone());
        }

        props
    }
}

/// Serde helper storing a `Duration` as whole milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
