//! The record data model: the unit of work flowing through the pipeline.

use serde::{Deserialize, Serialize};

/// A single `(name, bytes)` header pair carried alongside a record's
/// payload. Order is preserved end to end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Identifies the Kafka offset a record was read from, used to advance
/// (or withhold) commits until the record is durably published downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Original Kafka value, opaque to everything but the schema mapper.
    pub payload: Vec<u8>,
    /// Original Kafka key, may be empty.
    pub key: Vec<u8>,
    /// Stable identifier for the source topic, used to pick a schema.
    pub source_id: String,
    /// Carried alongside `payload` so the sink can decode even across a
    /// schema registry rotation.
    pub schema_version_id: u32,
    /// Topic name the record was consumed from.
    pub topic: String,
    pub origin: Origin,
    /// Present iff dedup is enabled for the source.
    pub dedup_id: Option<String>,
    pub headers: Vec<Header>,
}

impl Record {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_slice())
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let name = name.into();
        if let Some(existing) = self.headers.iter_mut().find(|h| h.name == name) {
            existing.value = value.into();
        } else {
            self.headers.push(Header::new(name, value));
        }
    }
}
