//! Diverts unrecoverable single records to a durable DLQ subject.
//! DLQ publish failures are fatal to the pipeline: we must never silently
//! drop a record we claim is unrecoverable.

use std::sync::Arc;

use kflow_core::backoff::{retry, BackoffPolicy};
use kflow_core::error::{DlqReason, PipelineError};
use kflow_core::record::Header;
use kflow_core::traits::Publisher;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Wire envelope published to `<pipeline_id>.dlq`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub original_headers: Vec<EnvelopeHeader>,
    pub reason: DlqReason,
    pub detail_text: String,
    pub ts: chrono::DateTime<chrono::Utc>,
    #[serde(with = "base64_bytes")]
    pub original_payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        // A plain byte-for-byte JSON array keeps the DLQ envelope legible
        // without pulling in a base64 dependency the rest of the crate has
        // no other use for.
        s.collect_seq(bytes.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(d)
    }
}

pub struct DlqWriter {
    publisher: Arc<dyn Publisher>,
    subject: String,
    policy: BackoffPolicy,
}

impl DlqWriter {
    pub fn new(publisher: Arc<dyn Publisher>, subject: String) -> Self {
        Self { publisher, subject, policy: BackoffPolicy::publish_retry() }
    }

    pub async fn write(
        &self,
        original_headers: Vec<Header>,
        original_payload: Vec<u8>,
        reason: DlqReason,
        detail_text: String,
    ) -> Result<(), PipelineError> {
        let envelope = DlqEnvelope {
            original_headers: original_headers
                .into_iter()
                .map(|h| EnvelopeHeader { name: h.name, value: h.value })
                .collect(),
            reason,
            detail_text,
            ts: chrono::Utc::now(),
            original_payload,
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| PipelineError::SinkFatal { detail: format!("failed to encode dlq envelope: {e}") })?;

        let result = retry(&self.policy, |attempt| {
            let publisher = self.publisher.clone();
            let subject = self.subject.clone();
            let payload = payload.clone();
            async move {
                if attempt > 0 {
                    tracing::warn!(attempt, subject = %subject, "retrying dlq publish");
                }
                publisher.publish(&subject, Vec::new(), payload).await
            }
        })
        .await;

        result.map_err(|e| {
            error!(subject = %self.subject, error = %e, "dlq publish exhausted retries, pipeline cannot continue");
            PipelineError::SinkFatal { detail: format!("dlq publish to '{}' failed: {e}", self.subject) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kflow_bus::memory::MemoryBus;
    use kflow_core::BusConsumer;
    use std::time::Duration;

    #[tokio::test]
    async fn writes_envelope_to_dlq_subject() {
        let bus = Arc::new(MemoryBus::new());
        let writer = DlqWriter::new(bus.clone(), "p1.dlq".to_string());
        writer
            .write(vec![Header::new("MsgId", b"a".to_vec())], b"payload".to_vec(), DlqReason::SchemaError, "missing field".into())
            .await
            .unwrap();
        assert_eq!(bus.pending("p1.dlq").await, 1);
        let mut sub = bus.subscribe("p1.dlq", "test", Duration::from_secs(5)).await.unwrap();
        let msg = sub.recv().await.unwrap();
        let envelope: DlqEnvelope = serde_json::from_slice(msg.payload()).unwrap();
        assert!(matches!(envelope.reason, DlqReason::SchemaError));
        assert_eq!(envelope.detail_text, "missing field");
    }
}
