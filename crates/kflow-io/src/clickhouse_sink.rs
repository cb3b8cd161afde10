//! Batching ClickHouse sink: accumulates bus messages into a single open
//! batch, sends it with idempotent append semantics, and bisects on
//! permanent (whole-batch) failures until the offending record is
//! isolated to the DLQ.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clickhouse::{Client, Row};
use kflow_bus::dedup::{ClaimOutcome, DedupStore};
use kflow_core::config::{BatchConfig, OnPermanentFailure};
use kflow_core::error::{DlqReason, PipelineError};
use kflow_core::fingerprint::RecordFingerprint;
use kflow_core::traits::{BatchInserter, BatchInserterFactory, BusMessage, ErrorClassifier, KeyValueStore, Transience};
use kflow_core::MSG_ID_HEADER;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::dlq::DlqWriter;

/// A row of already-projected values, serialized positionally. Relies on
/// the destination table's column order matching `column_mapping` order —
/// this implementation issues a bare `INSERT INTO {table} FORMAT
/// RowBinary` with no explicit column list.
#[derive(Debug, Clone)]
pub struct DynRow(pub Vec<Value>);

impl Serialize for DynRow {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeTuple;
        let mut tup = serializer.serialize_tuple(self.0.len())?;
        for v in &self.0 {
            tup.serialize_element(v)?;
        }
        tup.end()
    }
}

impl Row for DynRow {
    const COLUMN_NAMES: &'static [&'static str] = &[];
}

/// Builds fresh `clickhouse::insert::Insert` handles for one `(database,
/// table)`, bound to a single sink config for the lifetime of the process.
pub struct ClickHouseInserterFactory {
    client: Client,
    table: String,
}

impl ClickHouseInserterFactory {
    pub fn new(url: &str, database: &str, table: &str) -> Self {
        let client = Client::default().with_url(url).with_database(database).with_compression(clickhouse::Compression::Lz4);
        Self { client, table: table.to_string() }
    }
}

#[async_trait]
impl BatchInserterFactory for ClickHouseInserterFactory {
    async fn new_inserter(&self) -> Result<Box<dyn BatchInserter>, PipelineError> {
        let insert = self
            .client
            .insert(&self.table)
            .map_err(|e| PipelineError::TransientSink { detail: format!("failed to open insert for '{}': {e}", self.table) })?;
        Ok(Box::new(ClickHouseInserter { insert: Some(insert) }))
    }
}

pub struct ClickHouseInserter {
    insert: Option<clickhouse::insert::Insert<DynRow>>,
}

#[async_trait]
impl BatchInserter for ClickHouseInserter {
    async fn append_row(&mut self, row: &[Value]) -> Result<(), PipelineError> {
        let insert = self.insert.as_mut().ok_or_else(|| PipelineError::AppendError {
            detail: "append called on a closed insert handle".into(),
        })?;
        insert
            .write(&DynRow(row.to_vec()))
            .await
            .map_err(|e| PipelineError::AppendError { detail: e.to_string() })
    }

    async fn send(&mut self) -> anyhow::Result<()> {
        let insert = self.insert.take().ok_or_else(|| anyhow::anyhow!("send called on a closed insert handle"))?;
        insert.end().await?;
        Ok(())
    }
}

/// Classifies `clickhouse` crate errors: connection/timeout-shaped
/// failures are transient, everything else (constraint violations, type
/// mismatches) is permanent.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClickHouseErrorClassifier;

impl ErrorClassifier for ClickHouseErrorClassifier {
    fn classify(&self, err: &anyhow::Error) -> Transience {
        let msg = err.to_string().to_ascii_lowercase();
        let transient_markers = ["timeout", "timed out", "connection", "network", "too many", "overloaded", "503"];
        if transient_markers.iter().any(|m| msg.contains(m)) {
            Transience::Transient
        } else {
            Transience::Permanent
        }
    }
}

struct StagedMessage {
    fp: RecordFingerprint,
    bus_message: Box<dyn BusMessage>,
    row: Vec<Value>,
}

pub struct Batch {
    inserter: Box<dyn BatchInserter>,
    staged: Vec<StagedMessage>,
    fingerprints: HashSet<RecordFingerprint>,
    opened_at: Instant,
}

impl Batch {
    pub fn count(&self) -> usize {
        self.staged.len()
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

fn extract_msg_id(msg: &dyn BusMessage) -> Option<Vec<u8>> {
    msg.headers().iter().find(|h| h.name == MSG_ID_HEADER).map(|h| h.value.clone())
}

pub struct BatchController {
    factory: Arc<dyn BatchInserterFactory>,
    dlq: Arc<DlqWriter>,
    classifier: Arc<dyn ErrorClassifier>,
    config: BatchConfig,
    max_bisection_depth: u32,
    /// Second line of defense against duplicates the ingestor already
    /// fingerprints: re-claims the record's `MsgId` against a
    /// `KeyValueStore` before it is ever appended. Only set when
    /// `config.dedup_at_sink` is true and a KV store was supplied.
    dedup: Option<DedupStore<dyn KeyValueStore>>,
}

impl BatchController {
    pub fn new(
        factory: Arc<dyn BatchInserterFactory>,
        dlq: Arc<DlqWriter>,
        classifier: Arc<dyn ErrorClassifier>,
        config: BatchConfig,
        dedup_kv: Option<Arc<dyn KeyValueStore>>,
    ) -> Self {
        let max_bisection_depth = (config.max_batch_size as f64).log2().ceil() as u32 + 1;
        let dedup = if config.dedup_at_sink { dedup_kv.map(DedupStore::new) } else { None };
        Self { factory, dlq, classifier, config, max_bisection_depth, dedup }
    }

    async fn open_batch(&self) -> Result<Batch, PipelineError> {
        Ok(Batch {
            inserter: self.factory.new_inserter().await?,
            staged: Vec::new(),
            fingerprints: HashSet::new(),
            opened_at: Instant::now(),
        })
    }

    fn should_flush(&self, batch: &Batch) -> bool {
        if batch.count() >= self.config.max_batch_size {
            return true;
        }
        if let Some(max_wait) = self.config.max_batch_wait {
            if batch.opened_at.elapsed() >= max_wait {
                return true;
            }
        }
        false
    }

    /// Appends one bus message's already-projected row into the open
    /// batch. Idempotent on fingerprint: a redelivery already staged in
    /// this batch is acked and dropped without re-touching the insert. When
    /// `dedup_at_sink` is configured, a record whose `MsgId` was already
    /// claimed (in this batch or a prior one) is acked and dropped before
    /// that, too.
    pub async fn append(&self, batch: &mut Batch, bus_message: Box<dyn BusMessage>, row: Vec<Value>) -> Result<(), PipelineError> {
        let msg_id = extract_msg_id(bus_message.as_ref());

        if let Some(dedup) = &self.dedup {
            if let Some(dedup_id) = msg_id.as_deref().and_then(|id| std::str::from_utf8(id).ok()) {
                match dedup.try_claim(dedup_id).await {
                    ClaimOutcome::Duplicate => {
                        bus_message.ack().await?;
                        return Ok(());
                    }
                    ClaimOutcome::FirstSeen => {}
                    ClaimOutcome::StoreUnavailable => {
                        warn!(dedup_id, "sink dedup store unavailable, forwarding (fail-open)");
                    }
                }
            }
        }

        let fp = RecordFingerprint::compute(msg_id.as_deref(), bus_message.payload());

        if batch.fingerprints.contains(&fp) {
            bus_message.ack().await?;
            return Ok(());
        }

        match batch.inserter.append_row(&row).await {
            Ok(()) => {
                batch.fingerprints.insert(fp);
                batch.staged.push(StagedMessage { fp, bus_message, row });
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "append failed, routing record to dlq");
                self.dlq
                    .write(bus_message.headers().to_vec(), bus_message.payload().to_vec(), DlqReason::AppendError, e.to_string())
                    .await?;
                bus_message.ack().await?;
                Ok(())
            }
        }
    }

    pub fn should_flush_now(&self, batch: &Batch) -> bool {
        self.should_flush(batch)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.config.max_batch_wait
    }

    pub async fn open(&self) -> Result<Batch, PipelineError> {
        self.open_batch().await
    }

    /// Runs the send protocol for a batch: success acks everything and the
    /// caller reopens; transient failure naks for redelivery; permanent
    /// failure bisects down to a singleton DLQ entry.
    pub fn send(&self, batch: Batch) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>> {
        Box::pin(self.send_at_depth(batch, 0))
    }

    fn send_at_depth(&self, mut batch: Batch, depth: u32) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>> {
        Box::pin(async move {
            if batch.staged.is_empty() {
                return Ok(());
            }

            match batch.inserter.send().await {
                Ok(()) => {
                    for staged in &batch.staged {
                        staged.bus_message.ack().await?;
                    }
                    info!(count = batch.staged.len(), "batch sent");
                    Ok(())
                }
                Err(e) => match self.classifier.classify(&e) {
                    Transience::Transient => {
                        warn!(error = %e, count = batch.staged.len(), "transient sink failure, nak for redelivery");
                        for staged in &batch.staged {
                            staged.bus_message.nak(Some(Duration::from_millis(500))).await?;
                        }
                        Ok(())
                    }
                    Transience::Permanent => self.handle_permanent_failure(batch, depth, e).await,
                },
            }
        })
    }

    async fn handle_permanent_failure(&self, mut batch: Batch, depth: u32, err: anyhow::Error) -> Result<(), PipelineError> {
        if batch.staged.len() == 1 {
            let staged = batch.staged.pop().unwrap();
            self.dlq
                .write(
                    staged.bus_message.headers().to_vec(),
                    staged.bus_message.payload().to_vec(),
                    DlqReason::BatchRejected,
                    err.to_string(),
                )
                .await?;
            staged.bus_message.ack().await?;
            return Ok(());
        }

        if self.config.on_permanent_failure == OnPermanentFailure::DlqWholeBatch || depth >= self.max_bisection_depth {
            warn!(count = batch.staged.len(), depth, "dlq'ing whole batch instead of bisecting");
            for staged in batch.staged.drain(..) {
                self.dlq
                    .write(
                        staged.bus_message.headers().to_vec(),
                        staged.bus_message.payload().to_vec(),
                        DlqReason::BatchRejected,
                        err.to_string(),
                    )
                    .await?;
                staged.bus_message.ack().await?;
            }
            return Ok(());
        }

        let mid = batch.staged.len() / 2;
        let right_half = batch.staged.split_off(mid);
        let left_half = std::mem::take(&mut batch.staged);

        for half in [left_half, right_half] {
            let mut sub_batch = self.open_batch().await?;
            for staged in half {
                match sub_batch.inserter.append_row(&staged.row).await {
                    Ok(()) => {
                        sub_batch.fingerprints.insert(staged.fp);
                        sub_batch.staged.push(staged);
                    }
                    Err(e) => {
                        self.dlq
                            .write(staged.bus_message.headers().to_vec(), staged.bus_message.payload().to_vec(), DlqReason::AppendError, e.to_string())
                            .await?;
                        staged.bus_message.ack().await?;
                    }
                }
            }
            self.send_at_depth(sub_batch, depth + 1).await?;
        }

        Ok(())
    }
}
