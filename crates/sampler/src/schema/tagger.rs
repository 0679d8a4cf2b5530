//! PII tagging of Avro value schemas

use super::{value_subject, SchemaDescriptor, SchemaRegistry};
use crate::error::SchemaResult;
use pii_sampler_types::FieldClassification;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TAGS_KEY: &str = "confluent:tags";

/// Adds PII annotations to the record fields of a topic's value schema
#[derive(Clone)]
pub struct SchemaTagger {
    registry: Arc<dyn SchemaRegistry>,
}

impl SchemaTagger {
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Tag the latest schema of `topic` and register it as a new version.
    ///
    /// Returns the new schema id, or `None` when the topic has no Avro
    /// schema or no field annotation changed.
    pub async fn tag_topic(
        &self,
        topic: &str,
        classifications: &[FieldClassification],
    ) -> SchemaResult<Option<u32>> {
        let by_field: HashMap<&str, &FieldClassification> = classifications
            .iter()
            .filter(|c| !c.pii_types.is_empty())
            .map(|c| (c.field.as_str(), c))
            .collect();
        if by_field.is_empty() {
            return Ok(None);
        }

        let Some(current) = self.registry.fetch_schema(topic).await? else {
            debug!(topic, subject = %value_subject(topic), "No registered schema to tag");
            return Ok(None);
        };
        if !current.schema_type.eq_ignore_ascii_case("AVRO") {
            warn!(topic, schema_type = %current.schema_type, "Only Avro schemas can be tagged");
            return Ok(None);
        }

        let mut schema = current.schema.clone();
        let tagged = tag_schema(&mut schema, &by_field);
        if tagged == 0 {
            debug!(topic, "Schema tags already up to date");
            return Ok(None);
        }

        let descriptor = SchemaDescriptor {
            schema,
            ..current
        };
        let id = self.registry.register_schema(topic, &descriptor).await?;
        info!(topic, fields = tagged, schema_id = id, "Tagged PII fields in schema");
        Ok(Some(id))
    }
}

/// Annotation written into a field's `doc`
fn annotation(classification: &FieldClassification) -> String {
    let types: Vec<&str> = classification.pii_types.iter().map(|t| t.as_str()).collect();
    format!(
        "PII: {} (confidence: {:.2})",
        types.join(", "),
        classification.confidence
    )
}

/// Annotate matching fields in place, returning how many changed.
fn tag_schema(schema: &mut Value, by_field: &HashMap<&str, &FieldClassification>) -> usize {
    tag_node(schema, "", by_field)
}

fn tag_node(node: &mut Value, prefix: &str, by_field: &HashMap<&str, &FieldClassification>) -> usize {
    match node {
        // union
        Value::Array(branches) => branches
            .iter_mut()
            .map(|b| tag_node(b, prefix, by_field))
            .sum(),
        Value::Object(obj) => match obj.get("type").and_then(Value::as_str) {
            Some("record") => tag_record(obj, prefix, by_field),
            Some("array") => obj
                .get_mut("items")
                .map(|items| tag_node(items, prefix, by_field))
                .unwrap_or(0),
            Some("map") => obj
                .get_mut("values")
                .map(|values| tag_node(values, prefix, by_field))
                .unwrap_or(0),
            _ => 0,
        },
        _ => 0,
    }
}

fn tag_record(
    record: &mut Map<String, Value>,
    prefix: &str,
    by_field: &HashMap<&str, &FieldClassification>,
) -> usize {
    let Some(Value::Array(fields)) = record.get_mut("fields") else {
        return 0;
    };

    let mut changed = 0;
    for field in fields.iter_mut() {
        let Some(obj) = field.as_object_mut() else {
            continue;
        };
        let Some(name) = obj.get("name").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };

        let found = by_field
            .get(path.as_str())
            .or_else(|| by_field.get(name.as_str()));
        if let Some(classification) = found {
            changed += apply(obj, classification) as usize;
        }

        if let Some(ty) = obj.get_mut("type") {
            changed += tag_node(ty, &path, by_field);
        }
    }
    changed
}

fn apply(field: &mut Map<String, Value>, classification: &FieldClassification) -> bool {
    let doc = Value::String(annotation(classification));
    let tags = Value::Array(
        classification
            .tags
            .iter()
            .map(|t| Value::String(t.clone()))
            .collect(),
    );
    if field.get("doc") == Some(&doc) && field.get(TAGS_KEY) == Some(&tags) {
        return false;
    }
    field.insert("doc".to_string(), doc);
    field.insert(TAGS_KEY.to_string(), tags);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::InMemorySchemaRegistry;
    use pii_sampler_types::{Detection, PiiType};
    use serde_json::json;

    fn classification(field: &str, pii_type: PiiType) -> FieldClassification {
        FieldClassification::new(
            field,
            &[Detection {
                pii_type,
                confidence: 0.95,
                matched_samples: 10,
            }],
            10,
        )
    }

    fn user_schema() -> Value {
        json!({
            "type": "record",
            "name": "User",
            "fields": [
                {"name": "email", "type": "string"},
                {"name": "age", "type": "int"},
                {"name": "address", "type": ["null", {
                    "type": "record",
                    "name": "Address",
                    "fields": [{"name": "street", "type": "string"}]
                }]}
            ]
        })
    }

    #[test]
    fn test_tag_nested_fields() {
        let mut schema = user_schema();
        let email = classification("email", PiiType::Email);
        let street = classification("address.street", PiiType::Address);
        let by_field: HashMap<&str, &FieldClassification> =
            [("email", &email), ("address.street", &street)].into_iter().collect();

        assert_eq!(tag_schema(&mut schema, &by_field), 2);
        assert_eq!(schema["fields"][0]["doc"], "PII: EMAIL (confidence: 0.95)");
        assert_eq!(schema["fields"][0][TAGS_KEY], json!(["PII", "PII-Email"]));
        assert!(schema["fields"][1].get("doc").is_none());
        assert_eq!(
            schema["fields"][2]["type"][1]["fields"][0][TAGS_KEY],
            json!(["PII", "PII-Address"])
        );

        // a second pass changes nothing
        assert_eq!(tag_schema(&mut schema, &by_field), 0);
    }

    #[tokio::test]
    async fn test_tag_topic_registers_once() {
        let registry = Arc::new(InMemorySchemaRegistry::new());
        registry
            .register_schema("users", &SchemaDescriptor::avro("users-value", user_schema()))
            .await
            .unwrap();

        let tagger = SchemaTagger::new(registry.clone());
        let fields = vec![classification("email", PiiType::Email)];

        let id = tagger.tag_topic("users", &fields).await.unwrap();
        assert!(id.is_some());
        assert_eq!(registry.version_count("users"), 2);

        let again = tagger.tag_topic("users", &fields).await.unwrap();
        assert!(again.is_none());
        assert_eq!(registry.version_count("users"), 2);
    }

    #[tokio::test]
    async fn test_tag_topic_without_schema() {
        let tagger = SchemaTagger::new(Arc::new(InMemorySchemaRegistry::new()));
        let fields = vec![classification("email", PiiType::Email)];
        assert!(tagger.tag_topic("orders", &fields).await.unwrap().is_none());
    }
}
