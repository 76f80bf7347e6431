//! Codecs and the value factory.
//!
//! A [`Codec`] turns raw frame bytes into [`Value`]s and back. The shipped
//! [`JsonCodec`] delegates the text grammar to `serde_json`. A
//! [`ValueFactory`] is bound to exactly one codec and is the entry point the
//! transports use to create and decode values.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::message::Message;
use crate::object::ObjectValue;
use crate::value::Value;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed channel path.
    #[error("Invalid channel '{path}': {reason}")]
    InvalidChannel { path: String, reason: &'static str },

    /// Encoded text was not valid UTF-8.
    #[error("Invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// A pluggable wire codec.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Codec name, used in logs.
    fn name(&self) -> &'static str;

    /// Decode one value from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is too large or malformed.
    fn decode(&self, data: &[u8]) -> Result<Value, ProtocolError>;

    /// Encode a value into an existing buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    fn encode_into(&self, value: &Value, buf: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Encode an object into an existing buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    fn encode_object_into(
        &self,
        object: &ObjectValue,
        buf: &mut BytesMut,
    ) -> Result<(), ProtocolError>;
}

/// JSON text codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, data: &[u8]) -> Result<Value, ProtocolError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(data.len()));
        }

        let parsed: serde_json::Value = serde_json::from_slice(data)?;
        Ok(Value::from(parsed))
    }

    fn encode_into(&self, value: &Value, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        serde_json::to_writer(buf.writer(), value)?;
        Ok(())
    }

    fn encode_object_into(
        &self,
        object: &ObjectValue,
        buf: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        serde_json::to_writer(buf.writer(), object)?;
        Ok(())
    }
}

/// Creates values and decodes frames through one codec.
#[derive(Debug, Clone)]
pub struct ValueFactory {
    codec: Arc<dyn Codec>,
}

impl ValueFactory {
    /// Create a factory bound to `codec`.
    #[must_use]
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self { codec }
    }

    /// Create a factory bound to the JSON codec.
    #[must_use]
    pub fn json() -> Self {
        Self::new(Arc::new(JsonCodec))
    }

    #[must_use]
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    #[must_use]
    pub fn object_value(&self) -> ObjectValue {
        ObjectValue::new()
    }

    #[must_use]
    pub fn message(&self) -> Message {
        Message::new()
    }

    /// Decode one value.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec rejects the data.
    pub fn decode(&self, data: &[u8]) -> Result<Value, ProtocolError> {
        self.codec.decode(data)
    }

    /// Decode a batch of candidate messages.
    ///
    /// An array yields its elements, a single object is a batch of one.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or is neither an array nor
    /// an object.
    pub fn decode_batch(&self, data: &[u8]) -> Result<Vec<Value>, ProtocolError> {
        match self.decode(data)? {
            Value::Array(items) => Ok(items.iter().cloned().collect()),
            object @ Value::Object(_) => Ok(vec![object]),
            other => Err(ProtocolError::Invalid(format!(
                "expected array or object, got {:?}",
                other.value_type()
            ))),
        }
    }

    /// Encode a value to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the result is too large.
    pub fn encode(&self, value: &Value) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.codec.encode_into(value, &mut buf)?;

        if buf.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(buf.len()));
        }

        Ok(buf.freeze())
    }
}

impl Default for ValueFactory {
    fn default() -> Self {
        Self::json()
    }
}
