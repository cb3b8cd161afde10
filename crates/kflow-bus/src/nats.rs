//! Concrete NATS JetStream bus and colocated KV store.

use std::time::Duration;

use async_nats::jetstream::consumer::{pull::Config as PullConfig, AckPolicy};
use async_nats::jetstream::kv::Config as KvConfig;
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{self, Context};
use async_nats::Client;
use async_trait::async_trait;
use futures::StreamExt;
use kflow_core::error::PipelineError;
use kflow_core::record::Header;
use kflow_core::traits::{BusConsumer, BusMessage, KeyValueStore, Publisher, Subscription};

fn to_bus_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::TransientBus { detail: e.to_string() }
}

fn to_headers(headers: &[Header]) -> async_nats::HeaderMap {
    let mut map = async_nats::HeaderMap::new();
    for h in headers {
        map.insert(h.name.as_str(), String::from_utf8_lossy(&h.value).into_owned());
    }
    map
}

fn from_headers(headers: Option<&async_nats::HeaderMap>) -> Vec<Header> {
    let Some(headers) = headers else { return Vec::new() };
    headers
        .iter()
        .flat_map(|(name, values)| {
            values
                .iter()
                .map(move |v| Header::new(AsRef::<str>::as_ref(&name).to_string(), v.as_str().as_bytes().to_vec()))
        })
        .collect()
}

/// A NATS JetStream-backed bus: durable publish via a stream, durable
/// subscription via a pull consumer.
pub struct NatsBus {
    jetstream: Context,
}

impl NatsBus {
    pub fn new(client: Client) -> Self {
        Self {
            jetstream: jetstream::new(client),
        }
    }

    /// Ensures a stream backing `subject_prefix.*` exists before publish or
    /// subscribe; JetStream rejects publishes to subjects with no stream.
    pub async fn ensure_stream(&self, stream_name: &str, subjects: Vec<String>) -> Result<(), PipelineError> {
        self.jetstream
            .get_or_create_stream(StreamConfig {
                name: stream_name.to_string(),
                subjects,
                ..Default::default()
            })
            .await
            .map_err(to_bus_err)?;
        Ok(())
    }

    pub async fn kv(&self, bucket: &str, ttl: Duration) -> Result<NatsKv, PipelineError> {
        let store = self
            .jetstream
            .create_key_value(KvConfig {
                bucket: bucket.to_string(),
                max_age: ttl,
                ..Default::default()
            })
            .await
            .map_err(to_bus_err)?;
        Ok(NatsKv { store })
    }
}

#[async_trait]
impl Publisher for NatsBus {
    async fn publish(
        &self,
        subject: &str,
        headers: Vec<Header>,
        payload: Vec<u8>,
    ) -> Result<(), PipelineError> {
        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), to_headers(&headers), payload.into())
            .await
            .map_err(to_bus_err)?;
        ack.await.map_err(to_bus_err)?;
        Ok(())
    }
}

#[async_trait]
impl BusConsumer for NatsBus {
    async fn subscribe(
        &self,
        subject: &str,
        consumer_name: &str,
        ack_wait: Duration,
    ) -> Result<Box<dyn Subscription>, PipelineError> {
        let stream_name = self
            .jetstream
            .stream_by_subject(subject)
            .await
            .map_err(to_bus_err)?;
        let stream = self
            .jetstream
            .get_stream(stream_name)
            .await
            .map_err(to_bus_err)?;
        let consumer = stream
            .get_or_create_consumer(
                consumer_name,
                PullConfig {
                    durable_name: Some(consumer_name.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(to_bus_err)?;
        let messages = consumer.messages().await.map_err(to_bus_err)?;
        Ok(Box::new(NatsSubscription { messages }))
    }
}

struct NatsSubscription {
    messages: async_nats::jetstream::consumer::pull::Stream,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn recv(&mut self) -> Option<Box<dyn BusMessage>> {
        loop {
            match self.messages.next().await {
                Some(Ok(msg)) => {
                    let headers = from_headers(msg.headers.as_ref());
                    return Some(Box::new(NatsBusMessage { inner: msg, headers }));
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "nats pull consumer delivery error, retrying");
                    continue;
                }
                None => return None,
            }
        }
    }
}

struct NatsBusMessage {
    inner: jetstream::Message,
    headers: Vec<Header>,
}

#[async_trait]
impl BusMessage for NatsBusMessage {
    fn headers(&self) -> &[Header] {
        &self.headers
    }

    fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    async fn ack(&self) -> Result<(), PipelineError> {
        self.inner.ack().await.map_err(|e| to_bus_err(e))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), PipelineError> {
        use async_nats::jetstream::AckKind;
        let kind = match delay {
            Some(d) => AckKind::Nak(Some(d)),
            None => AckKind::Nak(None),
        };
        self.inner.ack_with(kind).await.map_err(|e| to_bus_err(e))
    }

    async fn term(&self) -> Result<(), PipelineError> {
        use async_nats::jetstream::AckKind;
        self.inner.ack_with(AckKind::Term).await.map_err(|e| to_bus_err(e))
    }
}

/// NATS KV bucket backing `kflow_bus::dedup::DedupStore`'s create-only
/// claims.
pub struct NatsKv {
    store: async_nats::jetstream::kv::Store,
}

#[async_trait]
impl KeyValueStore for NatsKv {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), PipelineError> {
        self.store.put(key, value.into()).await.map_err(to_bus_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        let entry = self.store.get(key).await.map_err(to_bus_err)?;
        Ok(entry.map(|b| b.to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<(), PipelineError> {
        self.store.delete(key).await.map_err(to_bus_err)?;
        Ok(())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<bool, PipelineError> {
        match self.store.create(key, value.into()).await {
            Ok(_) => Ok(true),
            // async-nats surfaces an already-exists wrong-last-revision
            // error here; anything else is a genuine store failure.
            Err(e) if e.to_string().to_ascii_lowercase().contains("wrong last sequence") => Ok(false),
            Err(e) if e.to_string().to_ascii_lowercase().contains("already exists") => Ok(false),
            Err(e) => Err(to_bus_err(e)),
        }
    }
}
