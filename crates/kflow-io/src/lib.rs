//! Kafka ingestion, schema mapping, DLQ writing, and ClickHouse batch
//! insertion: the driver-facing half of a kflow pipeline. `kflow-bus`
//! supplies the bus/KV traits this crate's components are generic over.

pub mod clickhouse_sink;
pub mod dlq;
pub mod ingestor;
pub mod kafka_consumer;
pub mod schema_mapper;
pub mod sink_runner;

pub use clickhouse_sink::{BatchController, ClickHouseErrorClassifier, ClickHouseInserterFactory};
pub use dlq::DlqWriter;
pub use ingestor::{Ingestor, IngestorState};
pub use kafka_consumer::KafkaTopicConsumer;
pub use sink_runner::{SinkRunner, SinkState};
