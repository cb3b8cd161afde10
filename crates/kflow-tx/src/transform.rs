//! Pure, stateless field operators applied to a record's JSON payload
//! before it reaches the sink's column projection. No I/O: every op is a
//! synchronous function over a `serde_json::Value`.

use kflow_core::config::TransformOpConfig;
use kflow_core::error::PipelineError;
use kflow_core::schema::DataType;
use serde_json::Value;
use tracing::trace;

/// One field-level operation. `Identity` exists so a pipeline can name a
/// field as "pass through unchanged" explicitly in its transform list,
/// distinct from a field that's simply absent from the list.
#[derive(Debug, Clone)]
pub enum FieldOp {
    Identity { field: String },
    Rename { from: String, to: String },
    Cast { field: String, to: DataType },
}

fn coercion_err(field: &str, detail: impl std::fmt::Display) -> PipelineError {
    PipelineError::CoercionError { field: field.to_string(), detail: detail.to_string() }
}

fn cast_value(field: &str, value: &Value, to: DataType) -> Result<Value, PipelineError> {
    match (value, to) {
        (Value::String(_), DataType::String) => Ok(value.clone()),
        (Value::String(s), DataType::Uuid) => {
            uuid::Uuid::parse_str(s).map_err(|e| coercion_err(field, e))?;
            Ok(Value::String(s.clone()))
        }
        (Value::String(s), DataType::Int64) => {
            s.parse::<i64>().map(|n| Value::from(n)).map_err(|e| coercion_err(field, e))
        }
        (Value::String(s), DataType::Float64) => {
            s.parse::<f64>().map(|n| Value::from(n)).map_err(|e| coercion_err(field, e))
        }
        (Value::Number(n), DataType::String) => Ok(Value::String(n.to_string())),
        (Value::Number(n), DataType::Int64) => {
            n.as_i64().map(Value::from).ok_or_else(|| coercion_err(field, "number has no exact i64 representation"))
        }
        (Value::Number(n), DataType::Float64) => {
            n.as_f64().map(Value::from).ok_or_else(|| coercion_err(field, "number has no exact f64 representation"))
        }
        (Value::Bool(b), DataType::UInt8) => Ok(Value::from(if *b { 1 } else { 0 })),
        (Value::Bool(_), DataType::Bool) => Ok(value.clone()),
        _ => Err(coercion_err(field, format!("no cast from {value} to {to:?}"))),
    }
}

/// Applies an ordered list of field operations to a JSON object payload.
/// `Rename` and `Cast` operate in place; `Identity` is a documented no-op.
pub struct Transformer {
    ops: Vec<FieldOp>,
}

impl Transformer {
    pub fn new(ops: Vec<FieldOp>) -> Self {
        Self { ops }
    }

    /// Translates a pipeline's declarative `transform` config into the ops
    /// this crate actually runs. The wire enum lives in `kflow-core` so
    /// `PipelineConfig` has no dependency on this crate.
    pub fn from_config(ops: &[TransformOpConfig]) -> Self {
        let ops = ops
            .iter()
            .map(|op| match op {
                TransformOpConfig::Identity { field } => FieldOp::Identity { field: field.clone() },
                TransformOpConfig::Rename { from, to } => FieldOp::Rename { from: from.clone(), to: to.clone() },
                TransformOpConfig::Cast { field, to } => FieldOp::Cast { field: field.clone(), to: *to },
            })
            .collect();
        Self::new(ops)
    }

    pub fn apply(&self, mut value: Value) -> Result<Value, PipelineError> {
        let obj = value.as_object_mut().ok_or_else(|| coercion_err("$", "transform input is not a JSON object"))?;

        for op in &self.ops {
            match op {
                FieldOp::Identity { field } => {
                    trace!(field = %field, "identity op");
                }
                FieldOp::Rename { from, to } => {
                    if let Some(v) = obj.remove(from) {
                        obj.insert(to.clone(), v);
                    }
                }
                FieldOp::Cast { field, to } => {
                    if let Some(v) = obj.get(field) {
                        let cast = cast_value(field, v, *to)?;
                        obj.insert(field.clone(), cast);
                    }
                }
            }
        }

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_leaves_payload_unchanged() {
        let tx = Transformer::new(vec![FieldOp::Identity { field: "event_id".into() }]);
        let input = json!({"event_id": "a"});
        assert_eq!(tx.apply(input.clone()).unwrap(), input);
    }

    #[test]
    fn rename_moves_value_to_new_key() {
        let tx = Transformer::new(vec![FieldOp::Rename { from: "old".into(), to: "new".into() }]);
        let out = tx.apply(json!({"old": 1})).unwrap();
        assert_eq!(out, json!({"new": 1}));
    }

    #[test]
    fn rename_of_missing_field_is_a_no_op() {
        let tx = Transformer::new(vec![FieldOp::Rename { from: "missing".into(), to: "new".into() }]);
        let out = tx.apply(json!({"other": 1})).unwrap();
        assert_eq!(out, json!({"other": 1}));
    }

    #[test]
    fn cast_string_to_int64() {
        let tx = Transformer::new(vec![FieldOp::Cast { field: "count".into(), to: DataType::Int64 }]);
        let out = tx.apply(json!({"count": "42"})).unwrap();
        assert_eq!(out, json!({"count": 42}));
    }

    #[test]
    fn cast_invalid_uuid_string_fails() {
        let tx = Transformer::new(vec![FieldOp::Cast { field: "id".into(), to: DataType::Uuid }]);
        assert!(tx.apply(json!({"id": "not-a-uuid"})).is_err());
    }

    #[test]
    fn from_config_translates_wire_ops() {
        let tx = Transformer::from_config(&[
            TransformOpConfig::Rename { from: "raw_count".into(), to: "count".into() },
            TransformOpConfig::Cast { field: "count".into(), to: DataType::Int64 },
        ]);
        let out = tx.apply(json!({"raw_count": "3"})).unwrap();
        assert_eq!(out, json!({"count": 3}));
    }

    #[test]
    fn ops_apply_in_declared_order() {
        let tx = Transformer::new(vec![
            FieldOp::Rename { from: "raw_count".into(), to: "count".into() },
            FieldOp::Cast { field: "count".into(), to: DataType::Int64 },
        ]);
        let out = tx.apply(json!({"raw_count": "7"})).unwrap();
        assert_eq!(out, json!({"count": 7}));
    }
}
