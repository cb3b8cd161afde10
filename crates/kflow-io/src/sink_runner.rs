//! Drives a `BatchController` from a live bus subscription: decodes each
//! message against the schema named by its `schema_version_id` header,
//! projects it through the sink's column mapping, and flushes on size or
//! the batch's max-wait timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kflow_core::config::{ColumnMapping, TransformOpConfig};
use kflow_core::error::{DlqReason, PipelineError};
use kflow_core::traits::{BusConsumer, SchemaStore};
use kflow_tx::Transformer;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clickhouse_sink::BatchController;
use crate::dlq::DlqWriter;
use crate::schema_mapper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Idle,
    Running,
    Draining,
    Stopped,
    Failed,
}

pub struct SinkRunner {
    state: Arc<RwLock<SinkState>>,
    draining: Arc<AtomicBool>,
    bus_consumer: Arc<dyn BusConsumer>,
    subject: String,
    consumer_name: String,
    ack_wait: Duration,
    schema_store: Arc<dyn SchemaStore>,
    source_id: String,
    column_mapping: Vec<ColumnMapping>,
    transform: Option<Transformer>,
    controller: BatchController,
    dlq: Arc<DlqWriter>,
}

impl SinkRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus_consumer: Arc<dyn BusConsumer>,
        subject: String,
        consumer_name: String,
        ack_wait: Duration,
        schema_store: Arc<dyn SchemaStore>,
        source_id: String,
        column_mapping: Vec<ColumnMapping>,
        transform_config: &[TransformOpConfig],
        controller: BatchController,
        dlq: Arc<DlqWriter>,
    ) -> Self {
        let transform = (!transform_config.is_empty()).then(|| Transformer::from_config(transform_config));
        Self {
            state: Arc::new(RwLock::new(SinkState::Idle)),
            draining: Arc::new(AtomicBool::new(false)),
            bus_consumer,
            subject,
            consumer_name,
            ack_wait,
            schema_store,
            source_id,
            column_mapping,
            transform,
            controller,
            dlq,
        }
    }

    pub async fn state(&self) -> SinkState {
        *self.state.read().await
    }

    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        *self.state.write().await = SinkState::Running;

        let mut subscription = self.bus_consumer.subscribe(&self.subject, &self.consumer_name, self.ack_wait).await?;
        let mut batch = Some(self.controller.open().await?);

        loop {
            if self.draining.load(Ordering::SeqCst) && batch.as_ref().map(|b| b.count()).unwrap_or(0) == 0 {
                break;
            }

            let wait = match (batch.as_ref(), self.controller.max_wait()) {
                (Some(b), Some(max_wait)) if b.count() > 0 => {
                    Some(max_wait.saturating_sub(b.age()))
                }
                _ => None,
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(subject = %self.subject, "sink cancelled");
                    if let Some(b) = batch.take() {
                        if b.count() > 0 {
                            self.controller.send(b).await?;
                        }
                    }
                    *self.state.write().await = SinkState::Stopped;
                    return Ok(());
                }
                maybe_msg = subscription.recv() => {
                    let Some(msg) = maybe_msg else {
                        warn!(subject = %self.subject, "bus subscription closed");
                        break;
                    };

                    let version_header = msg.headers().iter().find(|h| h.name == "schema_version_id").map(|h| h.value.clone());
                    let decoded = self.decode_and_project(&version_header, msg.payload()).await;

                    match decoded {
                        Ok(row) => {
                            if batch.is_none() {
                                batch = Some(self.controller.open().await?);
                            }
                            self.controller.append(batch.as_mut().unwrap(), msg, row).await?;
                        }
                        Err(e) => {
                            let reason = e.dlq_reason().unwrap_or(DlqReason::SchemaError);
                            self.dlq.write(msg.headers().to_vec(), msg.payload().to_vec(), reason, e.to_string()).await?;
                            msg.ack().await?;
                        }
                    }

                    if let Some(b) = &batch {
                        if self.controller.should_flush_now(b) {
                            let to_send = batch.take().unwrap();
                            self.controller.send(to_send).await?;
                            batch = Some(self.controller.open().await?);
                        }
                    }
                }
                _ = async {
                    match wait {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if let Some(b) = &batch {
                        if self.controller.should_flush_now(b) {
                            let to_send = batch.take().unwrap();
                            self.controller.send(to_send).await?;
                            batch = Some(self.controller.open().await?);
                        }
                    }
                }
            }
        }

        if let Some(b) = batch.take() {
            if b.count() > 0 {
                self.controller.send(b).await?;
            }
        }

        *self.state.write().await = SinkState::Stopped;
        Ok(())
    }

    async fn decode_and_project(&self, version_header: &Option<Vec<u8>>, payload: &[u8]) -> Result<Vec<serde_json::Value>, PipelineError> {
        let origin = kflow_core::record::Origin { partition: -1, offset: -1 };
        let version_id: u32 = version_header
            .as_ref()
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PipelineError::SchemaError {
                source_id: self.source_id.clone(),
                origin,
                detail: "message missing a valid schema_version_id header".into(),
            })?;

        let schema = self.schema_store.get(&self.source_id, version_id).await?;
        let value = schema_mapper::parse_payload(&schema, payload, origin)?;
        let value = match &self.transform {
            Some(tx) => tx.apply(value)?,
            None => value,
        };
        schema_mapper::project(&value, &self.column_mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kflow_bus::memory::MemoryBus;
    use kflow_core::config::{BatchConfig, OnPermanentFailure};
    use kflow_core::schema::{DataType, FieldSchema, PayloadEncoding, SchemaVersion};
    use kflow_core::traits::Publisher;
    use std::sync::Mutex as StdMutex;

    struct StaticSchemaStore(SchemaVersion);

    #[async_trait::async_trait]
    impl SchemaStore for StaticSchemaStore {
        async fn get(&self, _source_id: &str, _version_id: u32) -> Result<SchemaVersion, PipelineError> {
            Ok(self.0.clone())
        }
        async fn get_latest(&self, _source_id: &str) -> Result<SchemaVersion, PipelineError> {
            Ok(self.0.clone())
        }
    }

    struct NoopInserterFactory {
        rows: Arc<StdMutex<Vec<Vec<serde_json::Value>>>>,
    }
    struct NoopInserter {
        rows: Arc<StdMutex<Vec<Vec<serde_json::Value>>>>,
    }

    #[async_trait::async_trait]
    impl kflow_core::traits::BatchInserter for NoopInserter {
        async fn append_row(&mut self, row: &[serde_json::Value]) -> Result<(), PipelineError> {
            self.rows.lock().unwrap().push(row.to_vec());
            Ok(())
        }
        async fn send(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl kflow_core::traits::BatchInserterFactory for NoopInserterFactory {
        async fn new_inserter(&self) -> Result<Box<dyn kflow_core::traits::BatchInserter>, PipelineError> {
            Ok(Box::new(NoopInserter { rows: self.rows.clone() }))
        }
    }

    fn schema() -> SchemaVersion {
        SchemaVersion {
            source_id: "events".into(),
            version_id: 1,
            data_type: PayloadEncoding::Json,
            fields: vec![FieldSchema { name: "event_id".into(), data_type: DataType::String }],
        }
    }

    #[tokio::test]
    async fn flushes_on_max_batch_size() {
        let bus = Arc::new(MemoryBus::new());
        let dlq = Arc::new(DlqWriter::new(bus.clone(), "p1.dlq".into()));
        let rows = Arc::new(StdMutex::new(Vec::new()));
        let factory = Arc::new(NoopInserterFactory { rows: rows.clone() });
        let batch_config = BatchConfig { max_batch_size: 2, max_batch_wait: None, on_permanent_failure: OnPermanentFailure::Bisect, dedup_at_sink: false };
        let controller = BatchController::new(factory, dlq.clone(), Arc::new(crate::clickhouse_sink::ClickHouseErrorClassifier), batch_config, None);
        let mapping = vec![ColumnMapping {
            source_field: "event_id".into(),
            source_type: DataType::String,
            destination_field: "event_id".into(),
            destination_type: DataType::String,
        }];

        let runner = SinkRunner::new(
            bus.clone(),
            "events.data".into(),
            "sink1".into(),
            Duration::from_secs(5),
            Arc::new(StaticSchemaStore(schema())),
            "events".into(),
            mapping,
            &[],
            controller,
            dlq,
        );

        for i in 0..2 {
            bus.publish(
                "events.data",
                vec![kflow_core::record::Header::new("schema_version_id", b"1".to_vec())],
                serde_json::to_vec(&serde_json::json!({"event_id": format!("e{i}")})).unwrap(),
            )
            .await
            .unwrap();
        }

        let cancel = CancellationToken::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), runner.run(cancel)).await;

        assert_eq!(rows.lock().unwrap().len(), 2);
    }
}
