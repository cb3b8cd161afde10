//! In-memory bus and KV store used only by tests, so the ingestor/sink
//! logic can be exercised without a live NATS server. Never constructed by
//! the CLI binary.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use kflow_core::error::PipelineError;
use kflow_core::record::Header;
use kflow_core::traits::{BusConsumer, BusMessage, KeyValueStore, Publisher, Subscription};
use tokio::sync::{Mutex, Notify};

#[derive(Clone)]
struct QueueEntry {
    headers: Vec<Header>,
    payload: Vec<u8>,
}

struct MemorySubject {
    queue: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
}

impl MemorySubject {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

/// An in-process bus: subjects are FIFO queues, redelivery is driven by
/// explicit `nak()` calls rather than a real `ack_wait` timer.
#[derive(Default)]
pub struct MemoryBus {
    subjects: DashMap<String, Arc<MemorySubject>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subject(&self, name: &str) -> Arc<MemorySubject> {
        self.subjects
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemorySubject::new()))
            .clone()
    }

    /// Test helper: number of messages currently queued (neither delivered
    /// nor acked) on a subject.
    pub async fn pending(&self, subject: &str) -> usize {
        self.subject(subject).queue.lock().await.len()
    }
}

#[async_trait]
impl Publisher for MemoryBus {
    async fn publish(
        &self,
        subject: &str,
        headers: Vec<Header>,
        payload: Vec<u8>,
    ) -> Result<(), PipelineError> {
        let subj = self.subject(subject);
        subj.queue.lock().await.push_back(QueueEntry { headers, payload });
        subj.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl BusConsumer for MemoryBus {
    async fn subscribe(
        &self,
        subject: &str,
        _consumer_name: &str,
        _ack_wait: Duration,
    ) -> Result<Box<dyn Subscription>, PipelineError> {
        Ok(Box::new(MemorySubscription {
            subject: self.subject(subject),
        }))
    }
}

struct MemorySubscription {
    subject: Arc<MemorySubject>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Option<Box<dyn BusMessage>> {
        loop {
            if let Some(entry) = self.subject.queue.lock().await.pop_front() {
                return Some(Box::new(MemoryBusMessage {
                    headers: entry.headers.clone(),
                    payload: entry.payload.clone(),
                    entry,
                    subject: self.subject.clone(),
                }));
            }
            self.subject.notify.notified().await;
        }
    }
}

struct MemoryBusMessage {
    headers: Vec<Header>,
    payload: Vec<u8>,
    entry: QueueEntry,
    subject: Arc<MemorySubject>,
}

#[async_trait]
impl BusMessage for MemoryBusMessage {
    fn headers(&self) -> &[Header] {
        &self.headers
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn nak(&self, _delay: Option<Duration>) -> Result<(), PipelineError> {
        let mut q = self.subject.queue.lock().await;
        q.push_back(self.entry.clone());
        self.subject.notify.notify_waiters();
        Ok(())
    }

    async fn term(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}

struct KvEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// In-memory KV bucket with per-key TTL.
pub struct MemoryKv {
    ttl: Duration,
    entries: Mutex<HashMap<String, KvEntry>>,
}

impl MemoryKv {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn expired(entry: &KvEntry) -> bool {
        matches!(entry.expires_at, Some(t) if Instant::now() >= t)
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), PipelineError> {
        let expires_at = Some(Instant::now() + self.ttl);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), KvEntry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if Self::expired(entry) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), PipelineError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<bool, PipelineError> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(key) {
            if !Self::expired(existing) {
                return Ok(false);
            }
        }
        let expires_at = Some(Instant::now() + self.ttl);
        entries.insert(key.to_string(), KvEntry { value, expires_at });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_delivers_message() {
        let bus = MemoryBus::new();
        bus.publish("orders", vec![], b"hello".to_vec()).await.unwrap();
        let mut sub = bus.subscribe("orders", "c1", Duration::from_secs(5)).await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload(), b"hello");
    }

    #[tokio::test]
    async fn nak_redelivers_message() {
        let bus = MemoryBus::new();
        bus.publish("orders", vec![], b"hello".to_vec()).await.unwrap();
        let mut sub = bus.subscribe("orders", "c1", Duration::from_secs(5)).await.unwrap();
        let msg = sub.recv().await.unwrap();
        msg.nak(None).await.unwrap();
        let redelivered = sub.recv().await.unwrap();
        assert_eq!(redelivered.payload(), b"hello");
    }

    #[tokio::test]
    async fn kv_create_only_succeeds_once() {
        let kv = MemoryKv::new(Duration::from_secs(60));
        assert!(kv.create("k", b"v1".to_vec()).await.unwrap());
        assert!(!kv.create("k", b"v2".to_vec()).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn kv_expires_after_ttl() {
        let kv = MemoryKv::new(Duration::from_millis(10));
        kv.put("k", b"v".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn kv_reput_resets_ttl() {
        let kv = MemoryKv::new(Duration::from_millis(40));
        kv.put("k", b"v".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        kv.put("k", b"v2".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }
}
