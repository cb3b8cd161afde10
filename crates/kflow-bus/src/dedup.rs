//! Windowed deduplication on top of any `KeyValueStore`.

use kflow_core::error::PipelineError;
use kflow_core::traits::KeyValueStore;
use tracing::warn;

/// Outcome of a `try_claim` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This is the first time `dedup_id` has been seen within the window.
    FirstSeen,
    /// `dedup_id` was already claimed within the window.
    Duplicate,
    /// The store could not answer after bounded retry; caller should fail
    /// open and forward the record rather than stall the pipeline.
    StoreUnavailable,
}

/// Bounded retries before a `try_claim` gives up and fails open.
const MAX_CLAIM_ATTEMPTS: u32 = 3;

pub struct DedupStore<K: KeyValueStore + ?Sized> {
    kv: std::sync::Arc<K>,
}

impl<K: KeyValueStore + ?Sized> DedupStore<K> {
    pub fn new(kv: std::sync::Arc<K>) -> Self {
        Self { kv }
    }

    /// Atomically claims `dedup_id`: create-only put, retried up to
    /// `MAX_CLAIM_ATTEMPTS` times on store error before failing open.
    pub async fn try_claim(&self, dedup_id: &str) -> ClaimOutcome {
        let mut last_err: Option<PipelineError> = None;
        for attempt in 0..MAX_CLAIM_ATTEMPTS {
            match self.kv.create(dedup_id, now_marker()).await {
                Ok(true) => return ClaimOutcome::FirstSeen,
                Ok(false) => return ClaimOutcome::Duplicate,
                Err(e) => {
                    warn!(attempt, dedup_id, error = %e, "dedup store claim attempt failed");
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            warn!(dedup_id, error = %e, "dedup store unavailable after retries, failing open");
        }
        ClaimOutcome::StoreUnavailable
    }
}

fn now_marker() -> Vec<u8> {
    // Content is inspectable but not load-bearing: claims succeed or fail
    // purely on key presence, not on the stored value. Framed through the
    // same wire format as every other KV payload so a bucket dump decodes
    // uniformly regardless of which writer put the entry there.
    crate::wire::encode(0, b"claimed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn first_claim_succeeds_second_is_duplicate() {
        let kv = Arc::new(MemoryKv::new(Duration::from_secs(60)));
        let store = DedupStore::new(kv);
        assert_eq!(store.try_claim("A").await, ClaimOutcome::FirstSeen);
        assert_eq!(store.try_claim("A").await, ClaimOutcome::Duplicate);
        assert_eq!(store.try_claim("B").await, ClaimOutcome::FirstSeen);
    }

    #[tokio::test]
    async fn claim_expires_after_window() {
        let kv = Arc::new(MemoryKv::new(Duration::from_millis(20)));
        let store = DedupStore::new(kv);
        assert_eq!(store.try_claim("A").await, ClaimOutcome::FirstSeen);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.try_claim("A").await, ClaimOutcome::FirstSeen);
    }

    struct AlwaysErrKv;

    #[async_trait::async_trait]
    impl KeyValueStore for AlwaysErrKv {
        async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<(), PipelineError> {
            Err(PipelineError::TransientBus { detail: "down".into() })
        }
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, PipelineError> {
            Err(PipelineError::TransientBus { detail: "down".into() })
        }
        async fn delete(&self, _key: &str) -> Result<(), PipelineError> {
            Err(PipelineError::TransientBus { detail: "down".into() })
        }
        async fn create(&self, _key: &str, _value: Vec<u8>) -> Result<bool, PipelineError> {
            Err(PipelineError::TransientBus { detail: "down".into() })
        }
    }

    #[tokio::test]
    async fn fails_open_after_bounded_retries() {
        let store = DedupStore::new(std::sync::Arc::new(AlwaysErrKv));
        assert_eq!(store.try_claim("A").await, ClaimOutcome::StoreUnavailable);
    }
}
