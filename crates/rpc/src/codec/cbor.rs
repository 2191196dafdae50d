//! CBOR codec, the default binary format.

use crate::error::{CodecError, Result};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Encode a value into CBOR bytes.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    let mut vec = Vec::new();
    ciborium::ser::into_writer(value, &mut vec).map_err(CodecError::from)?;
    Ok(Bytes::from(vec))
}

/// Decode CBOR bytes into a value.
///
/// # Errors
///
/// Returns an error if the data is invalid or does not match `T`.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::de::from_reader(data)
        .map_err(CodecError::from)
        .map_err(Into::into)
}
