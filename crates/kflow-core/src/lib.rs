//! # kflow-core
//!
//! Foundational types, traits, and configuration structures shared by every
//! stage of the kflow streaming ETL runtime: the record and schema data
//! model, the capability traits a concrete bus/sink/consumer must implement,
//! the pipeline configuration schema consumed from the control plane, and
//! the error taxonomy that decides whether a failure is per-record or fatal
//! to the whole pipeline.
//!
//! Concrete implementations (NATS JetStream bus, rdkafka consumer, ClickHouse
//! sink) live in `kflow-bus` and `kflow-io`; this crate only depends on
//! `tokio`/`async-trait`/`serde` so it can be depended on from every other
//! crate in the workspace without pulling in driver-specific dependencies.

pub mod backoff;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod record;
pub mod schema;
pub mod signal;
pub mod traits;

pub use config::{
    BatchConfig, BusConfig, ColumnMapping, DedupConfig, OnPermanentFailure, PipelineConfig,
    SinkConfig, SourceConfig, TopicConfig, TransformOpConfig,
};
pub use error::{DlqReason, PipelineError};
pub use fingerprint::RecordFingerprint;
pub use record::{Header, Origin, Record};
pub use schema::{DataType, FieldSchema, SchemaVersion};
pub use signal::ComponentSignal;
pub use traits::{
    BatchInserter, BusConsumer, BusMessage, Consumer, FetchedRecord, KeyValueStore, Publisher,
    SchemaStore,
};

/// Stable identifier for a running pipeline instance, used as the
/// supervisor's registry key and carried on `ComponentSignal`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PipelineId(pub String);

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PipelineId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PipelineId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The reserved bus header name carrying `dedup_id`, used as `MsgId` so the
/// bus itself can suppress duplicate redeliveries.
pub const MSG_ID_HEADER: &str = "MsgId";

/// Well-known subject component failure signals are published to.
pub const COMPONENT_SIGNALS_SUBJECT: &str = "component-signals.failures";

/// Builds the DLQ subject for a pipeline: `<pipeline_id>.dlq`.
pub fn dlq_subject(pipeline_id: &PipelineId) -> String {
    format!("{}.dlq", pipeline_id.0)
}
