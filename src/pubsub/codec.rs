//! Payload codecs.
//!
//! A subscription and the publishers feeding it must agree on a codec;
//! the content type is stamped on every publish so a stray payload can be
//! identified from the broker's management UI.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::utils::error::CodecError;

/// Converts typed values to payload bytes and back.
///
/// Implementations are stateless and may be shared freely between tasks.
pub trait Codec: Copy + Send + Sync + 'static {
    fn content_type(&self) -> &'static str;

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError>;
}

/// Human-readable JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

/// Compact binary encoding via `bitcode`'s serde support.
///
/// Not human-inspectable, but round-trips everything serde can describe,
/// including `chrono` timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn content_type(&self) -> &'static str {
        "application/x-bitcode"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bitcode::serialize(value).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        bitcode::deserialize(data).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}
