//! Payload decoding into flattened field maps.
//!
//! Records framed in the schema-registry wire format (a zero magic byte,
//! then a big-endian schema id) are decoded as Avro with the writer schema
//! fetched from the registry. Everything else, and any framed record that
//! cannot be decoded that way, goes through the JSON path.

use crate::schema::SchemaRegistry;
use apache_avro::Schema as AvroSchema;
use dashmap::DashMap;
use pii_sampler_types::FieldMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

const MAGIC_BYTE: u8 = 0;
const HEADER_LEN: usize = 5;

/// Split a wire-format payload into its schema id and body.
pub fn wire_header(payload: &[u8]) -> Option<(u32, &[u8])> {
    if payload.len() < HEADER_LEN || payload[0] != MAGIC_BYTE {
        return None;
    }
    let id = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Some((id, &payload[HEADER_LEN..]))
}

/// Decodes record payloads, resolving Avro writer schemas by id.
///
/// Cloning shares the schema cache.
#[derive(Clone, Default)]
pub struct PayloadDecoder {
    registry: Option<Arc<dyn SchemaRegistry>>,
    /// Parsed writer schemas; `None` marks ids that are unknown or not Avro
    schemas: Arc<DashMap<u32, Option<Arc<AvroSchema>>>>,
}

impl PayloadDecoder {
    /// JSON only
    pub fn json() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self {
            registry: Some(registry),
            schemas: Arc::default(),
        }
    }

    /// Writer schemas resolved so far, including ids that had none
    pub fn cached_schemas(&self) -> usize {
        self.schemas.len()
    }

    /// Decode a payload into `path -> value` pairs.
    pub async fn decode(&self, payload: Option<&[u8]>) -> FieldMap {
        if let Some((id, body)) = payload.and_then(wire_header) {
            if let Some(schema) = self.writer_schema(id).await {
                match decode_avro(&schema, body) {
                    Some(value) => return flatten(Some(value)),
                    None => debug!(schema_id = id, "Avro decode failed, trying JSON"),
                }
            }
        }
        decode_fields(payload)
    }

    async fn writer_schema(&self, id: u32) -> Option<Arc<AvroSchema>> {
        if let Some(cached) = self.schemas.get(&id) {
            return cached.clone();
        }
        let registry = self.registry.as_ref()?;

        let descriptor = match registry.schema_by_id(id).await {
            Ok(descriptor) => descriptor,
            // not cached, so the next record retries the lookup
            Err(e) => {
                warn!(schema_id = id, error = %e, "Schema lookup failed");
                return None;
            }
        };

        let schema = descriptor
            .filter(|d| d.schema_type.eq_ignore_ascii_case("AVRO"))
            .and_then(|d| match AvroSchema::parse_str(&d.schema.to_string()) {
                Ok(schema) => Some(Arc::new(schema)),
                Err(e) => {
                    warn!(schema_id = id, error = %e, "Registered schema is not valid Avro");
                    None
                }
            });
        self.schemas.insert(id, schema.clone());
        schema
    }
}

fn decode_avro(schema: &AvroSchema, mut body: &[u8]) -> Option<Value> {
    let datum = apache_avro::from_avro_datum(schema, &mut body, None).ok()?;
    Value::try_from(datum).ok()
}

/// Parse a payload as JSON, tolerating a binary prefix such as a
/// schema-registry wire header before the first `{` or `[`.
pub fn parse_json(payload: &[u8]) -> Option<Value> {
    if let Ok(value) = serde_json::from_slice(payload) {
        return Some(value);
    }
    let start = payload
        .iter()
        .position(|b| *b == b'{')
        .or_else(|| payload.iter().position(|b| *b == b'['))?;
    serde_json::from_slice(&payload[start..]).ok()
}

/// Decode a payload into `path -> value` pairs.
///
/// Nested objects become dotted paths and array elements are indexed
/// (`items[0].sku`). A payload that is not JSON yields an empty map.
pub fn decode_fields(payload: Option<&[u8]>) -> FieldMap {
    flatten(payload.and_then(parse_json))
}

fn flatten(value: Option<Value>) -> FieldMap {
    let mut fields = FieldMap::new();
    match value {
        Some(Value::Object(map)) => {
            for (key, value) in map {
                flatten_into(&mut fields, key, value);
            }
        }
        Some(Value::Array(items)) => {
            for (i, item) in items.into_iter().enumerate() {
                flatten_into(&mut fields, format!("[{i}]"), item);
            }
        }
        Some(scalar) => {
            fields.insert("value".to_string(), scalar);
        }
        None => {}
    }
    fields
}

fn flatten_into(fields: &mut FieldMap, path: String, value: Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(fields, format!("{path}.{key}"), child);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.into_iter().enumerate() {
                flatten_into(fields, format!("{path}[{i}]"), item);
            }
        }
        leaf => {
            fields.insert(path, leaf);
        }
    }
}
