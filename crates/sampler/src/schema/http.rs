//! Confluent-compatible schema registry client

use super::{value_subject, SchemaDescriptor, SchemaRegistry};
use crate::error::{SchemaError, SchemaResult};
use crate::kafka::config::duration_millis;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

const CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

/// Registry connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRegistryConfig {
    /// Base URL; tagging is disabled when absent
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_timeout", with = "duration_millis")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for SchemaRegistryConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            timeout: default_timeout(),
        }
    }
}

impl SchemaRegistryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(url) = &self.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("schema registry url must be http(s): {url}"));
            }
        }
        if self.username.is_some() != self.password.is_some() {
            return Err("schema registry username and password must be set together".to_string());
        }
        if self.timeout.is_zero() {
            return Err("schema registry timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Wire shape of `GET /subjects/{subject}/versions/latest`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectVersion {
    subject: String,
    version: u32,
    id: u32,
    #[serde(default)]
    schema_type: Option<String>,
    schema: String,
}

/// Wire shape of `GET /schemas/ids/{id}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaById {
    #[serde(default)]
    schema_type: Option<String>,
    schema: String,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    id: u32,
}

/// REST client for a Confluent-compatible registry
#[derive(Clone)]
pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: impl Into<String>, config: &SchemaRegistryConfig) -> SchemaResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("pii-sampler/0.1")
            .build()?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        info!("Initialized schema registry client for: {}", base_url);

        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    /// Build a client from config, `None` when no url is configured
    pub fn from_config(config: &SchemaRegistryConfig) -> SchemaResult<Option<Self>> {
        match &config.url {
            Some(url) => Self::new(url.clone(), config).map(Some),
            None => Ok(None),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(reqwest::header::ACCEPT, CONTENT_TYPE);
        match &self.credentials {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }

    async fn error_for(subject: &str, response: reqwest::Response) -> SchemaError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        SchemaError::Status {
            status,
            subject: subject.to_string(),
            body,
        }
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn fetch_schema(&self, topic: &str) -> SchemaResult<Option<SchemaDescriptor>> {
        let subject = value_subject(topic);
        let url = format!("{}/subjects/{}/versions/latest", self.base_url, subject);
        debug!(subject = %subject, "Fetching latest schema");

        let response = self.request(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_for(&subject, response).await);
        }

        let latest: SubjectVersion = response.json().await?;
        let schema = serde_json::from_str(&latest.schema).map_err(|e| SchemaError::InvalidSchema {
            subject: latest.subject.clone(),
            reason: e.to_string(),
        })?;

        Ok(Some(SchemaDescriptor {
            subject: latest.subject,
            version: latest.version,
            id: latest.id,
            schema_type: latest.schema_type.unwrap_or_else(|| "AVRO".to_string()),
            schema,
        }))
    }

    async fn register_schema(&self, topic: &str, schema: &SchemaDescriptor) -> SchemaResult<u32> {
        let subject = value_subject(topic);
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);
        let body = json!({
            "schema": serde_json::to_string(&schema.schema)?,
            "schemaType": schema.schema_type,
        });

        let response = self
            .request(self.client.post(&url))
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_for(&subject, response).await);
        }

        let registered: RegisterResponse = response.json().await?;
        info!(subject = %subject, id = registered.id, "Registered schema version");
        Ok(registered.id)
    }

    async fn schema_by_id(&self, id: u32) -> SchemaResult<Option<SchemaDescriptor>> {
        let url = format!("{}/schemas/ids/{}", self.base_url, id);
        let label = format!("schema id {id}");
        debug!(id, "Fetching schema by id");

        let response = self.request(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_for(&label, response).await);
        }

        let found: SchemaById = response.json().await?;
        let schema = serde_json::from_str(&found.schema).map_err(|e| SchemaError::InvalidSchema {
            subject: label,
            reason: e.to_string(),
        })?;

        // the by-id endpoint does not say which subject or version it came from
        Ok(Some(SchemaDescriptor {
            subject: String::new(),
            version: 0,
            id,
            schema_type: found.schema_type.unwrap_or_else(|| "AVRO".to_string()),
            schema,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let mut config = SchemaRegistryConfig::default();
        assert!(config.validate().is_ok());

        config.url = Some("localhost:8081".to_string());
        assert!(config.validate().is_err());

        config.url = Some("http://localhost:8081".to_string());
        config.username = Some("svc".to_string());
        assert!(config.validate().is_err());

        config.password = Some("secret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_config_without_url() {
        let registry = HttpSchemaRegistry::from_config(&SchemaRegistryConfig::default()).unwrap();
        assert!(registry.is_none());
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let config = SchemaRegistryConfig::default();
        let registry = HttpSchemaRegistry::new("http://registry:8081/", &config).unwrap();
        assert_eq!(registry.base_url, "http://registry:8081");
    }

    #[test]
    fn test_subject_version_decoding() {
        let raw = r#"{"subject":"users-value","version":3,"id":17,"schema":"{\"type\":\"string\"}"}"#;
        let parsed: SubjectVersion = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.id, 17);
        assert!(parsed.schema_type.is_none());
    }

    #[test]
    fn test_schema_by_id_decoding() {
        let raw = r#"{"schemaType":"JSON","schema":"{\"type\":\"object\"}"}"#;
        let parsed: SchemaById = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.schema_type.as_deref(), Some("JSON"));
        assert_eq!(parsed.schema, r#"{"type":"object"}"#);
    }
}
