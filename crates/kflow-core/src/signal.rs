//! Component failure signalling.

use serde::{Deserialize, Serialize};

/// Published on `component-signals.failures` whenever a component
/// transitions to `Failed`, so external controllers can mark the pipeline
/// unhealthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSignal {
    pub pipeline_id: String,
    pub reason: String,
    pub text: String,
}

impl ComponentSignal {
    pub fn new(
        pipeline_id: impl Into<String>,
        reason: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            reason: reason.into(),
            text: text.into(),
        }
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
