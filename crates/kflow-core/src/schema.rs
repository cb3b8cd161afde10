//! Schema version data model.

use serde::{Deserialize, Serialize};

/// Declared scalar types a schema field or a sink column can carry.
/// `Json` is the only required `data_type` for a `SchemaVersion`; the
/// per-field types below back the coercion matrix in `kflow-io::schema`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Uuid,
    Int64,
    Float64,
    Bool,
    UInt8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

/// Payload encoding a `SchemaVersion` declares for its `source_id`. `Json`
/// is the only encoding implemented today; the enum is left open for
/// future pluggable encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    Json,
}

/// Immutable once published, addressed by `(source_id, version_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub source_id: String,
    pub version_id: u32,
    pub data_type: PayloadEncoding,
    pub fields: Vec<FieldSchema>,
}

impl SchemaVersion {
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}
