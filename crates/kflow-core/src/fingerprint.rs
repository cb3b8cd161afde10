//! Record fingerprints for idempotent batch append.
//!
//! Distinct from `dedup_id`: the fingerprint guards against the same bus
//! message being appended twice into one open batch (redelivery within the
//! batch's lifetime); `dedup_id` guards against the same logical record
//! being forwarded twice across the whole pipeline.

use std::hash::Hasher;

use twox_hash::XxHash64;

/// `fp = hash(MsgId or payload)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordFingerprint(pub u64);

impl RecordFingerprint {
    /// Computes the fingerprint for a bus message: prefers the `MsgId`
    /// header (== `dedup_id` when dedup is enabled) and falls back to the
    /// raw payload bytes otherwise.
    pub fn compute(msg_id: Option<&[u8]>, payload: &[u8]) -> Self {
        let mut hasher = XxHash64::with_seed(0);
        match msg_id {
            Some(id) => {
                hasher.write_u8(1);
                hasher.write(id);
            }
            None => {
                hasher.write_u8(0);
                hasher.write(payload);
            }
        }
        RecordFingerprint(hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_input() {
        let a = RecordFingerprint::compute(Some(b"id-1"), b"payload-a");
        let b = RecordFingerprint::compute(Some(b"id-1"), b"payload-b");
        assert_eq!(a, b, "fingerprint keyed on MsgId must ignore payload");
    }

    #[test]
    fn falls_back_to_payload_hash() {
        let a = RecordFingerprint::compute(None, b"payload-a");
        let b = RecordFingerprint::compute(None, b"payload-a");
        let c = RecordFingerprint::compute(None, b"payload-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
