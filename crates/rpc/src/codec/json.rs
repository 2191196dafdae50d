//! JSON codec, the textual format.

use crate::error::{CodecError, Result};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Encode a value into JSON bytes.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| CodecError::SerializationFailed(e.to_string()).into())
}

/// Decode JSON bytes into a value.
///
/// # Errors
///
/// Returns an error if the data is invalid or does not match `T`.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| CodecError::DeserializationFailed(e.to_string()).into())
}
