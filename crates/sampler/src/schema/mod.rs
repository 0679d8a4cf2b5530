//! Schema registry capability and PII tagging of registered schemas.

mod http;
mod tagger;

pub use http::{HttpSchemaRegistry, SchemaRegistryConfig};
pub use tagger::SchemaTagger;

use crate::error::SchemaResult;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};

/// Registry subject holding the value schema of `topic`
pub fn value_subject(topic: &str) -> String {
    format!("{topic}-value")
}

/// A registered schema version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub subject: String,
    pub version: u32,
    pub id: u32,
    /// `AVRO`, `JSON` or `PROTOBUF`
    pub schema_type: String,
    pub schema: Value,
}

impl SchemaDescriptor {
    pub fn avro(subject: impl Into<String>, schema: Value) -> Self {
        Self {
            subject: subject.into(),
            version: 0,
            id: 0,
            schema_type: "AVRO".to_string(),
            schema,
        }
    }
}

/// Fetch and register value schemas by topic.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Latest schema for the topic, `None` when the subject does not exist
    async fn fetch_schema(&self, topic: &str) -> SchemaResult<Option<SchemaDescriptor>>;

    /// Register a new version and return its schema id
    async fn register_schema(&self, topic: &str, schema: &SchemaDescriptor) -> SchemaResult<u32>;

    /// Schema registered under `id`, `None` when the id is unknown
    async fn schema_by_id(&self, id: u32) -> SchemaResult<Option<SchemaDescriptor>>;
}

/// In-process registry keeping every registered version.
#[derive(Debug, Default)]
pub struct InMemorySchemaRegistry {
    subjects: DashMap<String, Vec<SchemaDescriptor>>,
    next_id: AtomicU32,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of versions registered under the topic's subject
    pub fn version_count(&self, topic: &str) -> usize {
        self.subjects
            .get(&value_subject(topic))
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn fetch_schema(&self, topic: &str) -> SchemaResult<Option<SchemaDescriptor>> {
        Ok(self
            .subjects
            .get(&value_subject(topic))
            .and_then(|versions| versions.last().cloned()))
    }

    async fn register_schema(&self, topic: &str, schema: &SchemaDescriptor) -> SchemaResult<u32> {
        let subject = value_subject(topic);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut versions = self.subjects.entry(subject.clone()).or_default();
        let version = versions.len() as u32 + 1;
        versions.push(SchemaDescriptor {
            subject,
            version,
            id,
            schema_type: schema.schema_type.clone(),
            schema: schema.schema.clone(),
        });
        Ok(id)
    }

    async fn schema_by_id(&self, id: u32) -> SchemaResult<Option<SchemaDescriptor>> {
        Ok(self.subjects.iter().find_map(|versions| {
            versions.value().iter().find(|s| s.id == id).cloned()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_registry_versions() {
        let registry = InMemorySchemaRegistry::new();
        assert!(registry.fetch_schema("users").await.unwrap().is_none());

        let schema = SchemaDescriptor::avro("users-value", json!({"type": "string"}));
        let first = registry.register_schema("users", &schema).await.unwrap();
        let second = registry.register_schema("users", &schema).await.unwrap();
        assert_ne!(first, second);

        let latest = registry.fetch_schema("users").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.subject, "users-value");
        assert_eq!(registry.version_count("users"), 2);
    }

    #[tokio::test]
    async fn test_lookup_by_id() {
        let registry = InMemorySchemaRegistry::new();
        let schema = SchemaDescriptor::avro("users-value", json!({"type": "string"}));
        let id = registry.register_schema("users", &schema).await.unwrap();

        let found = registry.schema_by_id(id).await.unwrap().unwrap();
        assert_eq!(found.subject, "users-value");
        assert_eq!(found.version, 1);
        assert!(registry.schema_by_id(id + 100).await.unwrap().is_none());
    }
}
