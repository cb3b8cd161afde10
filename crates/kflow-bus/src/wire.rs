//! KV wire format for payloads stored in the bus's colocated KV store:
//! `[0x00 magic][4-byte big-endian schema_version][payload bytes]`.
//! Required for interop with replay tools; values shorter than 5 bytes or
//! with the wrong magic byte are rejected.

use thiserror::Error;

const MAGIC: u8 = 0x00;
const HEADER_LEN: usize = 1 + 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("kv value too short: {0} bytes, need at least {HEADER_LEN}")]
    TooShort(usize),
    #[error("kv value has wrong magic byte: {0:#04x}, expected {MAGIC:#04x}")]
    BadMagic(u8),
}

/// Encodes `(schema_version, payload)` into the KV wire format.
pub fn encode(schema_version: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(MAGIC);
    out.extend_from_slice(&schema_version.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decodes a KV wire value back into `(schema_version, payload)`.
pub fn decode(raw: &[u8]) -> Result<(u32, &[u8]), WireError> {
    if raw.len() < HEADER_LEN {
        return Err(WireError::TooShort(raw.len()));
    }
    if raw[0] != MAGIC {
        return Err(WireError::BadMagic(raw[0]));
    }
    let schema_version = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
    Ok((schema_version, &raw[HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_empty_payload() {
        let encoded = encode(7, b"");
        let (v, data) = decode(&encoded).unwrap();
        assert_eq!(v, 7);
        assert_eq!(data, b"");
    }

    #[test]
    fn round_trip_arbitrary_payload() {
        let encoded = encode(u32::MAX, b"\x00\x01binary\xffdata");
        let (v, data) = decode(&encoded).unwrap();
        assert_eq!(v, u32::MAX);
        assert_eq!(data, b"\x00\x01binary\xffdata");
    }

    #[test]
    fn rejects_short_values() {
        for len in 0..HEADER_LEN {
            let raw = vec![0u8; len];
            assert_eq!(decode(&raw), Err(WireError::TooShort(len)));
        }
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut encoded = encode(1, b"x");
        encoded[0] = 0x01;
        assert_eq!(decode(&encoded), Err(WireError::BadMagic(0x01)));
    }

    /// decode(encode(v, data)) = (v, data) for a spread of versions and
    /// byte strings, including the boundary of the u32 range.
    #[test]
    fn property_round_trip_holds_across_versions_and_data() {
        let versions: [u32; 6] = [0, 1, 255, 65536, u32::MAX - 1, u32::MAX];
        let payloads: [&[u8]; 4] = [b"", b"a", b"hello world", &[0xff; 256]];
        for &v in &versions {
            for &data in &payloads {
                let encoded = encode(v, data);
                let (dv, ddata) = decode(&encoded).unwrap();
                assert_eq!(dv, v);
                assert_eq!(ddata, data);
            }
        }
    }
}
