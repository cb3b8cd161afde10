//! Capability-set traits the core depends on instead of concrete drivers:
//! `Consumer`, `Publisher`, `KeyValueStore`, `BatchInserter`. Concrete
//! implementations live in `kflow-bus` (bus/KV) and `kflow-io` (Kafka
//! consumer, ClickHouse inserter).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::record::{Header, Origin};
use crate::schema::SchemaVersion;

/// One record pulled off a source, before schema resolution or dedup
/// tagging — just the bytes and the origin needed to commit them.
pub struct FetchedRecord {
    pub payload: Vec<u8>,
    pub key: Vec<u8>,
    pub origin: Origin,
}

/// A source the ingestor pulls records from and commits offsets against.
/// `KafkaTopicConsumer` (`kflow-io`) is the only production implementation;
/// tests substitute an in-memory fake so the ingestor's retry/dedup/commit
/// logic is exercised without a live Kafka broker.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Blocks until the next record arrives or the source errors.
    async fn fetch(&self) -> Result<FetchedRecord, PipelineError>;
    /// Commits the offset one past `origin.offset`.
    fn commit(&self, origin: Origin) -> Result<(), PipelineError>;
}

/// One message received from a durable bus subscription.
#[async_trait]
pub trait BusMessage: Send + Sync {
    fn headers(&self) -> &[Header];
    fn payload(&self) -> &[u8];
    async fn ack(&self) -> Result<(), PipelineError>;
    async fn nak(&self, delay: Option<Duration>) -> Result<(), PipelineError>;
    async fn term(&self) -> Result<(), PipelineError>;
}

/// A live subscription, yielding messages until the bus connection closes
/// or the subscription is dropped.
#[async_trait]
pub trait Subscription: Send {
    async fn recv(&mut self) -> Option<Box<dyn BusMessage>>;
}

/// Durable publish/subscribe over the message bus.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one message. A returned `Ok` implies the message is
    /// replicated per the bus's configured durability; callers rely on
    /// this before advancing their own upstream commit point.
    async fn publish(
        &self,
        subject: &str,
        headers: Vec<Header>,
        payload: Vec<u8>,
    ) -> Result<(), PipelineError>;
}

#[async_trait]
pub trait BusConsumer: Send + Sync {
    async fn subscribe(
        &self,
        subject: &str,
        consumer_name: &str,
        ack_wait: Duration,
    ) -> Result<Box<dyn Subscription>, PipelineError>;
}

/// The bus's colocated keyed TTL store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), PipelineError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PipelineError>;
    async fn delete(&self, key: &str) -> Result<(), PipelineError>;
    /// Create-only put: stores `value` iff `key` is absent, returning
    /// whether the store actually won the race. Backs the dedup store's
    /// compare-and-swap claim.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<bool, PipelineError>;
}

/// A read-through cache over a pluggable schema registry.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn get(&self, source_id: &str, version_id: u32) -> Result<SchemaVersion, PipelineError>;
    async fn get_latest(&self, source_id: &str) -> Result<SchemaVersion, PipelineError>;
}

/// A driver-level handle accumulating rows prior to transmission.
#[async_trait]
pub trait BatchInserter: Send {
    /// Appends one already-projected row. Coercion/type errors here are
    /// per-record (`AppendError`); anything thrown here must not be
    /// treated as a whole-batch failure.
    async fn append_row(&mut self, row: &[serde_json::Value]) -> Result<(), PipelineError>;

    /// Transmits every appended row as one batch.
    async fn send(&mut self) -> anyhow::Result<()>;
}

/// Builds fresh `BatchInserter` handles — needed both for the ordinary
/// reload after a successful send and to rebuild sub-batch inserters
/// during bisection.
#[async_trait]
pub trait BatchInserterFactory: Send + Sync {
    async fn new_inserter(&self) -> Result<Box<dyn BatchInserter>, PipelineError>;
}

/// Whether a sink failure should be retried via redelivery (`Transient`)
/// or isolated via bisection/DLQ (`Permanent`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transience {
    Transient,
    Permanent,
}

/// Pluggable classifier over a driver error, supplied as a predicate so
/// drivers with richer structured errors can override the default.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, err: &anyhow::Error) -> Transience;
}

/// In the absence of structured error info from the driver: connection
/// and timeout errors are transient, everything else is permanent.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorClassifier;

impl ErrorClassifier for DefaultErrorClassifier {
    fn classify(&self, err: &anyhow::Error) -> Transience {
        let msg = err.to_string().to_ascii_lowercase();
        let transient_markers = ["timeout", "timed out", "connection", "network", "overloaded", "503"];
        if transient_markers.iter().any(|m| msg.contains(m)) {
            Transience::Transient
        } else {
            Transience::Permanent
        }
    }
}
