//! Pipeline configuration, consumed as JSON from the external control plane.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::schema::{DataType, SchemaVersion};

/// Where a newly-subscribing consumer group should start reading if it has
/// no committed offset yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialOffset {
    Earliest,
    Latest,
}

/// Per-topic deduplication window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub enabled: bool,
    pub id_field: String,
    #[serde(with = "humantime_duration")]
    pub time_window: Duration,
}

/// `{ name, id, schema_ref, dedup, consumer_group_initial_offset }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    pub id: String,
    pub schema_ref: String,
    #[serde(default)]
    pub dedup: Option<DedupConfig>,
    #[serde(default = "default_initial_offset")]
    pub consumer_group_initial_offset: InitialOffset,
}

fn default_initial_offset() -> InitialOffset {
    InitialOffset::Earliest
}

/// Kafka connection parameters. Kept intentionally loose (a string map)
/// since the exact key set is driver/deployment specific; `kflow-io`'s
/// Kafka consumer reads the keys it understands (`bootstrap.servers`,
/// `group.id`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: String,
    pub connection_params: HashMap<String, String>,
    pub topics: Vec<TopicConfig>,
}

/// Wire form of one `kflow-tx` field operation. Kept here (rather than in
/// `kflow-tx`) so `PipelineConfig` has no dependency on the transform
/// crate; `kflow-tx::Transformer::from_config` is the only place that
/// interprets this enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOpConfig {
    Identity { field: String },
    Rename { from: String, to: String },
    Cast { field: String, to: DataType },
}

/// `{ source_field, source_type, destination_field, destination_type }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source_field: String,
    pub source_type: DataType,
    pub destination_field: String,
    pub destination_type: DataType,
}

/// What the batch controller does when ClickHouse rejects a whole batch
/// and bisection cannot or should not be used (decision recorded in
/// DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnPermanentFailure {
    Bisect,
    DlqWholeBatch,
}

impl Default for OnPermanentFailure {
    fn default() -> Self {
        OnPermanentFailure::Bisect
    }
}

/// `{ max_size, max_wait }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    #[serde(default, with = "humantime_duration_opt")]
    pub max_batch_wait: Option<Duration>,
    #[serde(default)]
    pub on_permanent_failure: OnPermanentFailure,
    /// Second line of defense: re-run the dedup gate inside the batch
    /// controller's `append`, for sources where the ingestor fails open.
    #[serde(default)]
    pub dedup_at_sink: bool,
}

/// `{ database, table, column_mapping, batch }` plus the `stream_id`/
/// `source_id` naming the bus subject and schema the sink reads from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub sink_type: String,
    pub stream_id: String,
    pub source_id: String,
    pub database: String,
    pub table: String,
    pub batch: BatchConfig,
    pub config: Vec<ColumnMapping>,
    /// Optional field-level transform applied to each record's payload
    /// immediately after schema parsing and before column projection.
    #[serde(default)]
    pub transform: Vec<TransformOpConfig>,
}

/// Connection parameters for the bus/KV layer backing ingestion and sink
/// delivery. `stream_name` backs the JetStream stream the pipeline's data
/// and DLQ subjects are published under; `dedup_kv_bucket` backs the
/// windowed dedup claim store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub url: String,
    pub stream_name: String,
    pub dedup_kv_bucket: String,
    #[serde(default = "default_ack_wait", with = "humantime_duration")]
    pub ack_wait: Duration,
}

fn default_ack_wait() -> Duration {
    Duration::from_secs(30)
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            stream_name: "kflow".to_string(),
            dedup_kv_bucket: "kflow-dedup".to_string(),
            ack_wait: default_ack_wait(),
        }
    }
}

/// Top-level pipeline configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline_id: String,
    pub name: String,
    #[serde(default)]
    pub bus: BusConfig,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub schema_versions: HashMap<String, SchemaVersion>,
}

mod humantime_duration {
    use super::Duration;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}s", d.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        let (num, unit) = raw.split_at(
            raw.find(|c: char| !c.is_ascii_digit())
                .ok_or_else(|| format!("missing unit in duration '{raw}'"))?,
        );
        let n: u64 = num
            .parse()
            .map_err(|_| format!("invalid duration magnitude in '{raw}'"))?;
        let secs = match unit {
            "s" => n,
            "m" => n * 60,
            "h" => n * 3600,
            other => return Err(format!("unknown duration unit '{other}' in '{raw}'")),
        };
        Ok(Duration::from_secs(secs))
    }
}

mod humantime_duration_opt {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&format!("{}s", d.as_secs())),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|r| super::humantime_duration::parse_duration(&r).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pipeline_config_json() {
        let json = serde_json::json!({
            "pipeline_id": "p1",
            "name": "events-pipeline",
            "source": {
                "type": "kafka",
                "connection_params": {"bootstrap.servers": "localhost:9092"},
                "topics": [{
                    "name": "events",
                    "id": "events",
                    "schema_ref": "events",
                    "dedup": {"enabled": true, "id_field": "event_id", "time_window": "60s"},
                    "consumer_group_initial_offset": "earliest"
                }]
            },
            "sink": {
                "type": "clickhouse",
                "stream_id": "events",
                "source_id": "events",
                "database": "default",
                "table": "events",
                "batch": {"max_batch_size": 500, "max_batch_wait": "5s"},
                "config": [{
                    "source_field": "event_id",
                    "source_type": "string",
                    "destination_field": "event_id",
                    "destination_type": "uuid"
                }]
            },
            "schema_versions": {}
        });

        let cfg: PipelineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.pipeline_id, "p1");
        assert_eq!(cfg.source.topics.len(), 1);
        let dedup = cfg.source.topics[0].dedup.as_ref().unwrap();
        assert_eq!(dedup.time_window, Duration::from_secs(60));
        assert_eq!(cfg.sink.batch.max_batch_size, 500);
        assert_eq!(cfg.sink.batch.max_batch_wait, Some(Duration::from_secs(5)));
    }
}
