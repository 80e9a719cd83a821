//! Versioned, checksummed envelopes for persisted state
//!
//! Trained models and baseline snapshots are written as a JSON envelope
//! carrying the payload type, a format version and the SHA-256 of the
//! serialized payload. Decoding rejects any envelope whose type, version or
//! checksum does not match.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PersistenceError;

/// Current envelope format version
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    payload_type: String,
    checksum: String,
    /// Serialized state, kept as text so the checksum covers exact bytes
    payload: String,
}

/// Encode `state` into an envelope tagged with `payload_type`
pub fn encode<T: Serialize>(payload_type: &str, state: &T) -> Result<Vec<u8>, PersistenceError> {
    let payload = serde_json::to_string(state)?;
    let checksum = compute_checksum(payload.as_bytes());
    let envelope = Envelope {
        format_version: FORMAT_VERSION,
        payload_type: payload_type.to_string(),
        checksum,
        payload,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Decode an envelope produced by [`encode`] for the same `payload_type`
pub fn decode<T: DeserializeOwned>(payload_type: &str, bytes: &[u8]) -> Result<T, PersistenceError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;

    if envelope.format_version != FORMAT_VERSION {
        return Err(PersistenceError::UnsupportedVersion(envelope.format_version));
    }
    if envelope.payload_type != payload_type {
        return Err(PersistenceError::TypeMismatch {
            expected: payload_type.to_string(),
            found: envelope.payload_type,
        });
    }

    let actual = compute_checksum(envelope.payload.as_bytes());
    if actual != envelope.checksum {
        return Err(PersistenceError::ChecksumMismatch {
            expected: envelope.checksum,
            actual,
        });
    }

    Ok(serde_json::from_str(&envelope.payload)?)
}

fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
