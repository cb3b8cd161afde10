//! Thin wrapper over `rdkafka::StreamConsumer` with manual offset commit,
//! so the ingestor controls exactly when an offset advances (only after
//! the corresponding record is durably published to the bus).

use kflow_core::config::InitialOffset;
use kflow_core::error::PipelineError;
use kflow_core::record::Origin;
use kflow_core::traits::{Consumer, FetchedRecord};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use std::collections::HashMap;

fn to_schema_err(topic: &str, origin: Origin, detail: impl std::fmt::Display) -> PipelineError {
    PipelineError::SchemaError {
        source_id: topic.to_string(),
        origin,
        detail: detail.to_string(),
    }
}

pub struct KafkaTopicConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaTopicConsumer {
    pub fn new(
        connection_params: &HashMap<String, String>,
        topic: &str,
        group_id: &str,
        initial_offset: InitialOffset,
    ) -> Result<Self, PipelineError> {
        let mut client_config = ClientConfig::new();
        for (k, v) in connection_params {
            client_config.set(k.as_str(), v.as_str());
        }
        client_config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set(
                "auto.offset.reset",
                match initial_offset {
                    InitialOffset::Earliest => "earliest",
                    InitialOffset::Latest => "latest",
                },
            );

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| PipelineError::ConfigError { detail: format!("failed to create kafka consumer: {e}") })?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| PipelineError::ConfigError { detail: format!("failed to subscribe to topic '{topic}': {e}") })?;

        Ok(Self { consumer, topic: topic.to_string() })
    }
}

#[async_trait::async_trait]
impl Consumer for KafkaTopicConsumer {
    /// Blocks until the next message arrives or the consumer errors.
    async fn fetch(&self) -> Result<FetchedRecord, PipelineError> {
        let msg = self
            .consumer
            .recv()
            .await
            .map_err(|e| PipelineError::TransientBus { detail: format!("kafka fetch error: {e}") })?;
        let partition = msg.partition();
        let offset = msg.offset();
        let origin = Origin { partition, offset };
        let payload = msg
            .payload()
            .ok_or_else(|| to_schema_err(&self.topic, origin, "message has no payload"))?
            .to_vec();
        let key = msg.key().map(|k| k.to_vec()).unwrap_or_default();
        Ok(FetchedRecord { payload, key, origin })
    }

    /// Commits the offset one past `origin.offset`, matching Kafka's
    /// "next offset to read" commit semantics.
    fn commit(&self, origin: Origin) -> Result<(), PipelineError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, origin.partition, Offset::Offset(origin.offset + 1))
            .map_err(|e| PipelineError::TransientBus { detail: format!("failed to build commit offset: {e}") })?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| PipelineError::TransientBus { detail: format!("kafka commit failed: {e}") })
    }
}
