//! Resolves a raw Kafka payload against a declared schema version, extracts
//! dedup keys by dotted path, and projects records into typed rows per a
//! column mapping's fixed coercion matrix.

use std::collections::HashMap;

use async_trait::async_trait;
use kflow_core::config::{ColumnMapping, PipelineConfig};
use kflow_core::error::PipelineError;
use kflow_core::record::Origin;
use kflow_core::schema::{DataType, PayloadEncoding, SchemaVersion};
use kflow_core::traits::SchemaStore;
use serde_json::Value;

/// A read-through cache over the schema versions embedded in a pipeline's
/// configuration document. Real deployments could swap in a store backed
/// by an external registry without changing any caller of `SchemaStore`.
pub struct ConfigSchemaStore {
    versions: HashMap<(String, u32), SchemaVersion>,
    latest: HashMap<String, u32>,
}

impl ConfigSchemaStore {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut versions = HashMap::new();
        let mut latest: HashMap<String, u32> = HashMap::new();
        for schema in config.schema_versions.values() {
            let key = (schema.source_id.clone(), schema.version_id);
            let is_newer = latest
                .get(&schema.source_id)
                .map(|&v| schema.version_id > v)
                .unwrap_or(true);
            if is_newer {
                latest.insert(schema.source_id.clone(), schema.version_id);
            }
            versions.insert(key, schema.clone());
        }
        Self { versions, latest }
    }
}

#[async_trait]
impl SchemaStore for ConfigSchemaStore {
    async fn get(&self, source_id: &str, version_id: u32) -> Result<SchemaVersion, PipelineError> {
        self.versions
            .get(&(source_id.to_string(), version_id))
            .cloned()
            .ok_or_else(|| PipelineError::SchemaError {
                source_id: source_id.to_string(),
                origin: Origin { partition: -1, offset: -1 },
                detail: format!("no schema version {version_id} registered for source '{source_id}'"),
            })
    }

    async fn get_latest(&self, source_id: &str) -> Result<SchemaVersion, PipelineError> {
        let version_id = self.latest.get(source_id).copied().ok_or_else(|| PipelineError::SchemaError {
            source_id: source_id.to_string(),
            origin: Origin { partition: -1, offset: -1 },
            detail: format!("no schema registered for source '{source_id}'"),
        })?;
        self.get(source_id, version_id).await
    }
}

/// Parses a raw payload according to its schema's declared encoding.
pub fn parse_payload(schema: &SchemaVersion, payload: &[u8], origin: Origin) -> Result<Value, PipelineError> {
    match schema.data_type {
        PayloadEncoding::Json => serde_json::from_slice(payload).map_err(|e| PipelineError::SchemaError {
            source_id: schema.source_id.clone(),
            origin,
            detail: format!("invalid json payload: {e}"),
        }),
    }
}

/// Returns the scalar at a dotted path, e.g. `"user.id"` looks up
/// `value["user"]["id"]`. Fails if any segment is missing or the leaf is
/// not scalar.
pub fn extract_key(value: &Value, field_path: &str, schema: &SchemaVersion, origin: Origin) -> Result<Value, PipelineError> {
    let mut cursor = value;
    for segment in field_path.split('.') {
        cursor = cursor.get(segment).ok_or_else(|| PipelineError::SchemaError {
            source_id: schema.source_id.clone(),
            origin,
            detail: format!("key path '{field_path}' not found (missing segment '{segment}')"),
        })?;
    }
    if cursor.is_object() || cursor.is_array() {
        return Err(PipelineError::SchemaError {
            source_id: schema.source_id.clone(),
            origin,
            detail: format!("key path '{field_path}' does not resolve to a scalar"),
        });
    }
    Ok(cursor.clone())
}

fn scalar_to_dedup_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Computes `dedup_id` for a parsed payload, per the topic's `id_field`.
pub fn compute_dedup_id(value: &Value, id_field: &str, schema: &SchemaVersion, origin: Origin) -> Result<String, PipelineError> {
    extract_key(value, id_field, schema, origin).map(|v| scalar_to_dedup_string(&v))
}

/// Projects a parsed payload into an ordered row of destination-typed
/// values per `column_mapping`. Coercion matrix: string -> UUID (validated),
/// string -> integers (parsed), number -> string, bool -> UInt8, and
/// identity when source and destination types match. Anything else is a
/// `CoercionError`.
pub fn project(value: &Value, mapping: &[ColumnMapping]) -> Result<Vec<Value>, PipelineError> {
    mapping
        .iter()
        .map(|m| {
            let field_value = value.get(&m.source_field).ok_or_else(|| PipelineError::CoercionError {
                field: m.destination_field.clone(),
                detail: format!("source field '{}' missing from payload", m.source_field),
            })?;
            coerce(field_value, m.source_type, m.destination_type, &m.destination_field)
        })
        .collect()
}

fn coerce(value: &Value, source_type: DataType, destination_type: DataType, field: &str) -> Result<Value, PipelineError> {
    use DataType::*;
    if source_type == destination_type {
        return Ok(value.clone());
    }
    match (source_type, destination_type) {
        (String, Uuid) => {
            let s = value.as_str().ok_or_else(|| coercion_err(field, "expected string for UUID coercion"))?;
            uuid::Uuid::parse_str(s)
                .map(|u| Value::String(u.to_string()))
                .map_err(|e| coercion_err(field, &format!("invalid UUID '{s}': {e}")))
        }
        (String, Int64) => {
            let s = value.as_str().ok_or_else(|| coercion_err(field, "expected string for int coercion"))?;
            s.parse::<i64>()
                .map(Value::from)
                .map_err(|e| coercion_err(field, &format!("invalid integer '{s}': {e}")))
        }
        (String, UInt8) => {
            let s = value.as_str().ok_or_else(|| coercion_err(field, "expected string for int coercion"))?;
            s.parse::<u8>()
                .map(Value::from)
                .map_err(|e| coercion_err(field, &format!("invalid integer '{s}': {e}")))
        }
        (Int64, String) | (Float64, String) => Ok(Value::String(value.to_string())),
        (Bool, UInt8) => {
            let b = value.as_bool().ok_or_else(|| coercion_err(field, "expected bool for UInt8 coercion"))?;
            Ok(Value::from(if b { 1u8 } else { 0u8 }))
        }
        _ => Err(coercion_err(
            field,
            &format!("unsupported coercion {source_type:?} -> {destination_type:?}"),
        )),
    }
}

fn coercion_err(field: &str, detail: &str) -> PipelineError {
    PipelineError::CoercionError {
        field: field.to_string(),
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kflow_core::config::ColumnMapping;
    use kflow_core::schema::FieldSchema;
    use serde_json::json;

    fn origin() -> Origin {
        Origin { partition: 0, offset: 0 }
    }

    fn schema() -> SchemaVersion {
        SchemaVersion {
            source_id: "events".into(),
            version_id: 1,
            data_type: PayloadEncoding::Json,
            fields: vec![FieldSchema { name: "event_id".into(), data_type: DataType::String }],
        }
    }

    #[test]
    fn extract_key_finds_nested_scalar() {
        let value = json!({"user": {"id": "u1"}});
        let key = extract_key(&value, "user.id", &schema(), origin()).unwrap();
        assert_eq!(key, json!("u1"));
    }

    #[test]
    fn extract_key_fails_on_missing_segment() {
        let value = json!({"user": {}});
        assert!(extract_key(&value, "user.id", &schema(), origin()).is_err());
    }

    #[test]
    fn extract_key_fails_on_non_scalar_leaf() {
        let value = json!({"user": {"id": {"nested": true}}});
        assert!(extract_key(&value, "user.id", &schema(), origin()).is_err());
    }

    #[test]
    fn project_applies_fixed_coercion_matrix() {
        let value = json!({
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "count": "42",
            "active": true,
            "score": 7
        });
        let mapping = vec![
            ColumnMapping {
                source_field: "id".into(),
                source_type: DataType::String,
                destination_field: "id".into(),
                destination_type: DataType::Uuid,
            },
            ColumnMapping {
                source_field: "count".into(),
                source_type: DataType::String,
                destination_field: "count".into(),
                destination_type: DataType::Int64,
            },
            ColumnMapping {
                source_field: "active".into(),
                source_type: DataType::Bool,
                destination_field: "active".into(),
                destination_type: DataType::UInt8,
            },
            ColumnMapping {
                source_field: "score".into(),
                source_type: DataType::Int64,
                destination_field: "score".into(),
                destination_type: DataType::String,
            },
        ];
        let row = project(&value, &mapping).unwrap();
        assert_eq!(row[0], json!("550e8400-e29b-41d4-a716-446655440000"));
        assert_eq!(row[1], json!(42));
        assert_eq!(row[2], json!(1));
        assert_eq!(row[3], json!("7"));
    }

    #[test]
    fn project_rejects_invalid_uuid() {
        let value = json!({"id": "not-a-uuid"});
        let mapping = vec![ColumnMapping {
            source_field: "id".into(),
            source_type: DataType::String,
            destination_field: "id".into(),
            destination_type: DataType::Uuid,
        }];
        assert!(project(&value, &mapping).is_err());
    }

    #[test]
    fn project_rejects_unsupported_conversion() {
        let value = json!({"flag": true});
        let mapping = vec![ColumnMapping {
            source_field: "flag".into(),
            source_type: DataType::Bool,
            destination_field: "flag".into(),
            destination_type: DataType::Uuid,
        }];
        assert!(project(&value, &mapping).is_err());
    }
}
