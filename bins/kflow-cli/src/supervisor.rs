//! Owns every running pipeline's lifecycle: start order is bus connect then
//! sink then ingestor, so the sink is already draining its subject before
//! the ingestor can publish to it; stop order reverses that, draining the
//! ingestor first so no in-flight record is lost mid-shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kflow_bus::nats::NatsBus;
use kflow_core::config::PipelineConfig;
use kflow_core::traits::{BatchInserterFactory, KeyValueStore, Publisher, SchemaStore};
use kflow_core::{ComponentSignal, PipelineId, COMPONENT_SIGNALS_SUBJECT};
use kflow_io::schema_mapper::ConfigSchemaStore;
use kflow_io::{
    BatchController, ClickHouseErrorClassifier, ClickHouseInserterFactory, DlqWriter, Ingestor,
    KafkaTopicConsumer, SinkRunner,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct PipelineHandle {
    cancel: CancellationToken,
    ingestors: Vec<Arc<Ingestor>>,
    sinks: Vec<Arc<SinkRunner>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Supervises every pipeline started from this process, watching each
/// component's task for a fatal exit and publishing a `ComponentSignal`
/// when one occurs.
pub struct Supervisor {
    root_cancel: CancellationToken,
    nats_bus: Arc<NatsBus>,
    pipelines: RwLock<HashMap<PipelineId, PipelineHandle>>,
}

impl Supervisor {
    pub async fn connect(bus_url: &str) -> Result<Self> {
        let client = async_nats::connect(bus_url)
            .await
            .with_context(|| format!("failed to connect to nats at '{bus_url}'"))?;
        Ok(Self {
            root_cancel: CancellationToken::new(),
            nats_bus: Arc::new(NatsBus::new(client)),
            pipelines: RwLock::new(HashMap::new()),
        })
    }

    pub fn root_cancel(&self) -> CancellationToken {
        self.root_cancel.clone()
    }

    /// Brings up the bus plumbing, the sink, then the ingestor for every
    /// topic in `config.source.topics`.
    pub async fn start(&self, config: PipelineConfig) -> Result<()> {
        let pipeline_id: PipelineId = config.pipeline_id.clone().into();
        let data_subjects: Vec<String> = config
            .source
            .topics
            .iter()
            .map(|t| format!("{}.data", t.id))
            .collect();
        let dlq_subject = kflow_core::dlq_subject(&pipeline_id);
        let mut subjects = data_subjects.clone();
        subjects.push(dlq_subject.clone());
        subjects.push(COMPONENT_SIGNALS_SUBJECT.to_string());

        self.nats_bus
            .ensure_stream(&config.bus.stream_name, subjects)
            .await
            .context("failed to provision jetstream stream")?;

        let dedup_needs_kv = config.source.topics.iter().any(|t| t.dedup.as_ref().is_some_and(|d| d.enabled));
        let dedup_kv: Option<Arc<dyn KeyValueStore>> = if dedup_needs_kv {
            let longest_window = config
                .source
                .topics
                .iter()
                .filter_map(|t| t.dedup.as_ref())
                .map(|d| d.time_window)
                .max()
                .unwrap_or(Duration::from_secs(60));
            let kv = self.nats_bus.kv(&config.bus.dedup_kv_bucket, longest_window).await?;
            Some(Arc::new(kv))
        } else {
            None
        };

        let schema_store: Arc<dyn SchemaStore> = Arc::new(ConfigSchemaStore::from_config(&config));
        let publisher: Arc<dyn Publisher> = self.nats_bus.clone();
        let dlq = Arc::new(DlqWriter::new(publisher.clone(), dlq_subject));

        let pipeline_cancel = self.root_cancel.child_token();
        let mut tasks = Vec::new();
        let mut sinks = Vec::new();
        let mut ingestors = Vec::new();

        // Sink first: the subject it reads from must have a live consumer
        // before the ingestor is allowed to publish into it.
        let insert_factory: Arc<dyn BatchInserterFactory> = Arc::new(ClickHouseInserterFactory::new(
            &config.bus.url,
            &config.sink.database,
            &config.sink.table,
        ));
        let controller = BatchController::new(
            insert_factory,
            dlq.clone(),
            Arc::new(ClickHouseErrorClassifier),
            config.sink.batch.clone(),
            dedup_kv.clone(),
        );
        let sink_subject = format!("{}.data", config.sink.stream_id);
        let sink_runner = Arc::new(SinkRunner::new(
            self.nats_bus.clone(),
            sink_subject,
            format!("{}-sink", pipeline_id),
            config.bus.ack_wait,
            schema_store.clone(),
            config.sink.source_id.clone(),
            config.sink.config.clone(),
            &config.sink.transform,
            controller,
            dlq.clone(),
        ));
        sinks.push(sink_runner.clone());

        let sink_cancel = pipeline_cancel.child_token();
        let sink_signal_publisher = publisher.clone();
        let sink_pipeline_id = pipeline_id.clone();
        let sink_for_task = sink_runner.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = sink_for_task.run(sink_cancel).await {
                error!(pipeline_id = %sink_pipeline_id, error = %e, "sink task failed");
                publish_failure_signal(sink_signal_publisher.as_ref(), &sink_pipeline_id, "sink", &e.to_string()).await;
            }
        }));

        // Then the ingestor, one per configured topic.
        for topic in &config.source.topics {
            let consumer: Arc<dyn kflow_core::traits::Consumer> = Arc::new(
                KafkaTopicConsumer::new(
                    &config.source.connection_params,
                    &topic.name,
                    &format!("{}-{}", pipeline_id, topic.id),
                    topic.consumer_group_initial_offset,
                )
                .context("failed to build kafka consumer")?,
            );

            let ingestor = Arc::new(Ingestor::new(
                consumer,
                schema_store.clone(),
                publisher.clone(),
                dedup_kv.clone(),
                dlq.clone(),
                topic.clone(),
                format!("{}.data", topic.id),
            ));
            ingestors.push(ingestor.clone());

            let ingestor_cancel = pipeline_cancel.child_token();
            let ingestor_signal_publisher = publisher.clone();
            let ingestor_pipeline_id = pipeline_id.clone();
            let ingestor_for_task = ingestor.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = ingestor_for_task.run(ingestor_cancel).await {
                    error!(pipeline_id = %ingestor_pipeline_id, error = %e, "ingestor task failed");
                    publish_failure_signal(ingestor_signal_publisher.as_ref(), &ingestor_pipeline_id, "ingestor", &e.to_string()).await;
                }
            }));
        }

        self.pipelines.write().await.insert(
            pipeline_id,
            PipelineHandle {
                cancel: pipeline_cancel,
                ingestors,
                sinks,
                tasks,
            },
        );
        Ok(())
    }

    /// Graceful stop: drains every ingestor first, waits up to `grace` for
    /// in-flight work, then drains the sink so any partially-filled batch
    /// is flushed before the pipeline's tasks are awaited.
    pub async fn stop(&self, pipeline_id: &PipelineId, grace: Duration) -> Result<()> {
        let mut pipelines = self.pipelines.write().await;
        let Some(handle) = pipelines.remove(pipeline_id) else {
            anyhow::bail!("no running pipeline '{pipeline_id}'");
        };
        drop(pipelines);

        for ingestor in &handle.ingestors {
            ingestor.begin_drain();
        }
        tokio::time::sleep(grace).await;
        for sink in &handle.sinks {
            sink.begin_drain();
        }
        handle.cancel.cancel();
        for task in handle.tasks {
            let _ = task.await;
        }
        Ok(())
    }

    /// Hard cancel: no drain, no grace period.
    pub async fn terminate(&self, pipeline_id: &PipelineId) -> Result<()> {
        let mut pipelines = self.pipelines.write().await;
        let Some(handle) = pipelines.remove(pipeline_id) else {
            anyhow::bail!("no running pipeline '{pipeline_id}'");
        };
        drop(pipelines);
        handle.cancel.cancel();
        for task in handle.tasks {
            let _ = task.await;
        }
        Ok(())
    }

    /// Cancels every pipeline and waits for their tasks, used on
    /// process-wide shutdown (ctrl-c).
    pub async fn shutdown_all(&self) {
        self.root_cancel.cancel();
        let mut pipelines = self.pipelines.write().await;
        for (pipeline_id, handle) in pipelines.drain() {
            info!(%pipeline_id, "waiting for pipeline tasks to stop");
            for task in handle.tasks {
                let _ = task.await;
            }
        }
    }
}

async fn publish_failure_signal(publisher: &dyn Publisher, pipeline_id: &PipelineId, reason: &str, detail: &str) {
    let signal = ComponentSignal::new(pipeline_id.to_string(), reason, detail);
    let Ok(payload) = signal.to_json_bytes() else {
        warn!(%pipeline_id, "failed to encode component signal");
        return;
    };
    if let Err(e) = publisher.publish(COMPONENT_SIGNALS_SUBJECT, Vec::new(), payload).await {
        warn!(%pipeline_id, error = %e, "failed to publish component failure signal");
    }
}
