//! Optional `postcard` helpers for RPC and sync-value payloads.
//!
//! The replication core treats payloads as opaque bytes. Hosts that want a
//! serde encoding can use these to produce and consume them.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::WireError;

/// Serializes `value` into a payload.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    postcard::to_allocvec(value).map_err(|e| WireError::Payload(e.to_string()))
}

/// Deserializes a payload produced by [`encode_payload`].
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    postcard::from_bytes(bytes).map_err(|e| WireError::Payload(e.to_string()))
}
