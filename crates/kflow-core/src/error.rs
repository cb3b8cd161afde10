//! Error taxonomy. Each variant carries enough context to both log the
//! failure and, where applicable, build a DLQ envelope from it.

use crate::record::Origin;

/// The `reason` field of a DLQ envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum DlqReason {
    SchemaError,
    CoercionError,
    AppendError,
    BatchRejected,
    SinkFatal,
}

impl std::fmt::Display for DlqReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DlqReason::SchemaError => "SchemaError",
            DlqReason::CoercionError => "CoercionError",
            DlqReason::AppendError => "AppendError",
            DlqReason::BatchRejected => "BatchRejected",
            DlqReason::SinkFatal => "SinkFatal",
        };
        f.write_str(s)
    }
}

/// Localized variants (`SchemaError` through `BatchRejected`) never stop
/// the pipeline; `ConfigError` and `SinkFatal` always do.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("schema resolution/extraction failed for source '{source_id}' at {origin:?}: {detail}")]
    SchemaError {
        source_id: String,
        origin: Origin,
        detail: String,
    },

    #[error("type coercion failed for field '{field}': {detail}")]
    CoercionError { field: String, detail: String },

    #[error("append to prepared insert failed: {detail}")]
    AppendError { detail: String },

    #[error("batch rejected by sink, isolated via bisection: {detail}")]
    BatchRejected { detail: String },

    #[error("transient sink failure, batch will be retried via redelivery: {detail}")]
    TransientSink { detail: String },

    #[error("transient bus failure on publish: {detail}")]
    TransientBus { detail: String },

    #[error("pipeline configuration rejected: {detail}")]
    ConfigError { detail: String },

    #[error("unrecoverable sink failure, pipeline stopping: {detail}")]
    SinkFatal { detail: String },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether this error can be localized to a single record (and thus
    /// must never stop the pipeline).
    pub fn is_per_record(&self) -> bool {
        matches!(
            self,
            PipelineError::SchemaError { .. }
                | PipelineError::CoercionError { .. }
                | PipelineError::AppendError { .. }
                | PipelineError::BatchRejected { .. }
        )
    }

    /// Maps a per-record error to the DLQ reason it should be filed under.
    /// Returns `None` for errors that are not per-record.
    pub fn dlq_reason(&self) -> Option<DlqReason> {
        match self {
            PipelineError::SchemaError { .. } => Some(DlqReason::SchemaError),
            PipelineError::CoercionError { .. } => Some(DlqReason::CoercionError),
            PipelineError::AppendError { .. } => Some(DlqReason::AppendError),
            PipelineError::BatchRejected { .. } => Some(DlqReason::BatchRejected),
            PipelineError::SinkFatal { .. } => Some(DlqReason::SinkFatal),
            _ => None,
        }
    }
}
